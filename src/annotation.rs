//! Line-oriented parser for the labelled translation response.
//!
//! The model is asked to answer with
//!
//! ```text
//! 翻訳結果: <translation>
//! 注釈: <note, possibly continued on the following lines>
//! ```
//!
//! Anything else is tolerated. The parser is total: it never fails and falls
//! back to fixed placeholders for whatever it could not find.

pub const TRANSLATION_LABEL: &str = "翻訳結果";
pub const NOTE_LABEL: &str = "注釈";

/// Placeholder when no `翻訳結果:` line is present.
pub const TRANSLATION_MISSING: &str = "翻訳失敗";
/// Placeholder when no `注釈:` line is present.
pub const NOTE_MISSING: &str = "注釈取得失敗";

const LABEL_COLONS: [char; 2] = [':', '：'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub translation: String,
    pub note: String,
}

impl Default for Annotation {
    fn default() -> Self {
        Self {
            translation: TRANSLATION_MISSING.to_string(),
            note: NOTE_MISSING.to_string(),
        }
    }
}

/// Extracts the translation and note from a raw response.
///
/// The first `翻訳結果:` line wins. The first `注釈:` line wins as well, and
/// every non-blank line right after it is appended to the note with a single
/// space, stopping at the first blank line. Later `注釈:` lines are ignored.
pub fn parse_annotation(response: &str) -> Annotation {
    let lines = response.lines().collect::<Vec<_>>();
    let mut translation = None;
    let mut note: Option<String> = None;

    for (index, line) in lines.iter().enumerate() {
        if let Some(value) = labelled_value(line, TRANSLATION_LABEL) {
            if translation.is_none() {
                translation = Some(value.to_string());
            }
        } else if let Some(value) = labelled_value(line, NOTE_LABEL) {
            if note.is_some() {
                continue;
            }
            let mut text = value.to_string();
            for next in lines.iter().skip(index + 1) {
                let next = next.trim();
                if next.is_empty() {
                    break;
                }
                text.push(' ');
                text.push_str(next);
            }
            note = Some(text);
        }
    }

    let mut annotation = Annotation::default();
    if let Some(translation) = translation {
        annotation.translation = translation;
    }
    if let Some(note) = note {
        annotation.note = note;
    }
    annotation
}

/// Returns the trimmed text after `label` followed by an ASCII or full-width
/// colon, if the line carries that label anywhere.
fn labelled_value<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let mut search_from = 0usize;
    while let Some(offset) = line[search_from..].find(label) {
        let after = search_from + offset + label.len();
        let rest = &line[after..];
        if let Some(colon) = rest.chars().next().filter(|c| LABEL_COLONS.contains(c)) {
            return Some(rest[colon.len_utf8()..].trim());
        }
        search_from = after;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_both_labels() {
        let parsed = parse_annotation(
            "翻訳結果: 米国 / JWALK社 / コンサルティング料\n注釈: JWALKはニューヨークの調査会社。",
        );
        assert_eq!(parsed.translation, "米国 / JWALK社 / コンサルティング料");
        assert_eq!(parsed.note, "JWALKはニューヨークの調査会社。");
    }

    #[test]
    fn note_absorbs_lines_until_blank() {
        let parsed = parse_annotation("注釈: A\nB\n\nC");
        assert_eq!(parsed.note, "A B");
        assert_eq!(parsed.translation, TRANSLATION_MISSING);
    }

    #[test]
    fn empty_response_yields_placeholders() {
        assert_eq!(parse_annotation(""), Annotation::default());
        assert_eq!(
            parse_annotation("I cannot help with that."),
            Annotation::default()
        );
    }

    #[test]
    fn missing_note_keeps_note_placeholder() {
        let parsed = parse_annotation("前置き\n翻訳結果: 会議費");
        assert_eq!(parsed.translation, "会議費");
        assert_eq!(parsed.note, NOTE_MISSING);
    }

    #[test]
    fn label_may_be_prefixed_and_use_fullwidth_colon() {
        let parsed = parse_annotation("- 翻訳結果： 旅費交通費\n**注釈:** 出張旅費");
        assert_eq!(parsed.translation, "旅費交通費");
        // bold markers stay; only the label is stripped
        assert_eq!(parsed.note, "** 出張旅費");
    }

    #[test]
    fn label_without_colon_is_not_a_label() {
        let parsed = parse_annotation("翻訳結果なし\n注釈なし");
        assert_eq!(parsed, Annotation::default());
    }

    #[test]
    fn first_translation_line_wins() {
        let parsed = parse_annotation("翻訳結果: 一\n翻訳結果: 二");
        assert_eq!(parsed.translation, "一");
    }

    #[test]
    fn repeated_note_label_keeps_first_block() {
        let parsed = parse_annotation("注釈: 最初\n続き\n\n注釈: 二番目\n追記");
        assert_eq!(parsed.note, "最初 続き");
    }

    #[test]
    fn continuation_lines_are_still_scanned_for_translation() {
        let parsed = parse_annotation("注釈: 補足\n翻訳結果: 広告宣伝費");
        assert_eq!(parsed.note, "補足 翻訳結果: 広告宣伝費");
        assert_eq!(parsed.translation, "広告宣伝費");
    }

    #[test]
    fn crlf_line_endings_are_handled() {
        let parsed = parse_annotation("翻訳結果: 通信費\r\n注釈: 携帯電話\r\n料金\r\n\r\n末尾");
        assert_eq!(parsed.translation, "通信費");
        assert_eq!(parsed.note, "携帯電話 料金");
    }

    proptest! {
        #[test]
        fn parser_is_total_and_deterministic(input in any::<String>()) {
            let first = parse_annotation(&input);
            let second = parse_annotation(&input);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn unlabelled_text_always_degrades(input in "[^注翻]*") {
            prop_assert_eq!(parse_annotation(&input), Annotation::default());
        }

        #[test]
        fn translation_value_round_trips(value in "[a-zA-Z0-9ぁ-ん ]{0,40}") {
            let parsed = parse_annotation(&format!("翻訳結果: {}", value));
            prop_assert_eq!(parsed.translation, value.trim());
        }
    }
}
