//! The two-stage ABC tokenizer.
//!
//! Stage one splits the raw tune body at every notation-significant
//! character, so each fragment begins with its trigger. Stage two walks
//! the fragments and reassembles the pieces that belong together:
//! accidentals join their note letter, bracketed inline fields run to the
//! closing bracket, bar lines and repeat digits merge, tuplet markers
//! merge, quoted annotations disappear, and `+`-delimited dynamics fold
//! into one lower-cased token. The result is the token stream the tune
//! player interprets.

/// Characters that start a new fragment in stage one.
fn is_token_starter(c: char) -> bool {
    matches!(
        c,
        '|' | ':'
            | '['
            | '{'
            | ']'
            | '}'
            | 'z'
            | 'x'
            | 'Z'
            | 'A'..='G'
            | 'a'..='g'
            | '_'
            | '='
            | '^'
            | '<'
            | '>'
            | '('
            | ' '
            | '-'
            | '"'
            | '+'
    )
}

fn is_note_letter(c: char) -> bool {
    matches!(c, 'A'..='G' | 'a'..='g')
}

fn is_bar_char(c: char) -> bool {
    matches!(c, '|' | ':' | '[' | ']' | '0'..='9')
}

fn is_tuplet_char(c: char) -> bool {
    matches!(c, '(' | ':' | '0'..='9')
}

/// Field letters that may appear inlined as `[X:...]` inside a tune body.
fn is_inline_field_char(c: char) -> bool {
    matches!(
        c,
        'I' | 'K' | 'L' | 'M' | 'm' | 'N' | 'P' | 'Q' | 'R' | 'r' | 's' | 'T' | 'U' | 'V' | 'W'
            | 'w'
    )
}

fn first_char(s: &str) -> char {
    s.chars().next().unwrap_or(' ')
}

/// Tokenizes a filtered tune body (newlines, tabs and backslashes already
/// removed) into tune tokens.
pub fn tokenize(code: &str) -> Vec<String> {
    let mut first_pass: Vec<String> = Vec::new();
    let mut current = String::new();
    for c in code.chars() {
        if is_token_starter(c) {
            if !current.is_empty() {
                first_pass.push(std::mem::take(&mut current));
            }
            current.push(c);
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        first_pass.push(current);
    }

    let mut tokens: Vec<String> = Vec::new();
    let mut i = 0;
    while i < first_pass.len() {
        let start = first_char(&first_pass[i]);
        let mut token: Option<String> = None;

        if start == '^' || start == '_' {
            // Accidental runs absorb the note letter they decorate.
            let mut merged = String::new();
            while first_char(&first_pass[i]) == start || is_note_letter(first_char(&first_pass[i]))
            {
                merged.push_str(&first_pass[i]);
                if is_note_letter(first_char(&first_pass[i])) {
                    break;
                }
                i += 1;
                if i >= first_pass.len() {
                    break;
                }
            }
            token = Some(merged);
        } else if start == '=' {
            // Naturals collapse to a single marker plus the note letter.
            let mut merged = String::from("=");
            while first_char(&first_pass[i]) == '=' || is_note_letter(first_char(&first_pass[i])) {
                if is_note_letter(first_char(&first_pass[i])) {
                    merged.push_str(&first_pass[i]);
                    break;
                }
                i += 1;
                if i >= first_pass.len() {
                    break;
                }
            }
            token = Some(merged);
        } else if start == '['
            && (first_pass[i]
                .chars()
                .nth(1)
                .map(is_inline_field_char)
                .unwrap_or(false)
                || (i + 1 < first_pass.len()
                    && is_inline_field_char(first_char(&first_pass[i + 1]))))
        {
            // A bracketed inline header field runs to the closing bracket.
            let mut merged = String::new();
            while !merged.ends_with(']') {
                merged.push_str(&first_pass[i]);
                i += 1;
                if i >= first_pass.len() {
                    break;
                }
            }
            i = i.saturating_sub(1);
            token = Some(merged);
        } else if (start == '['
            && i + 1 < first_pass.len()
            && is_bar_char(first_char(&first_pass[i + 1]))
            && first_char(&first_pass[i + 1]) != ']')
            || start == '|'
            || start == ':'
            || start.is_ascii_digit()
        {
            // Bar lines, repeats and their digits merge into one token.
            let mut merged = String::new();
            while is_bar_char(first_char(&first_pass[i])) {
                if i > 0 && first_char(&first_pass[i]) == '[' && first_char(&first_pass[i - 1]) == '|'
                {
                    break;
                }
                merged.push_str(&first_pass[i]);
                i += 1;
                if i >= first_pass.len() {
                    break;
                }
            }
            i = i.saturating_sub(1);
            token = Some(merged);
        } else if start == '(' {
            let mut merged = String::new();
            while is_tuplet_char(first_char(&first_pass[i])) {
                merged.push_str(&first_pass[i]);
                i += 1;
                if i >= first_pass.len() {
                    break;
                }
            }
            i = i.saturating_sub(1);
            token = Some(merged);
        } else if start == '"' {
            // Quoted annotation text is not tokenized at all.
            i += 1;
            while i < first_pass.len() && first_char(&first_pass[i]) != '"' {
                i += 1;
            }
        } else if start == '+' {
            token = merge_dynamics(&first_pass, &mut i);
        } else {
            token = Some(first_pass[i].clone());
        }

        if let Some(token) = token {
            tokens.push(token);
        }
        i += 1;
    }

    tokens
}

/// Folds a `+`-delimited dynamics marker into one lower-cased token.
/// Without a closing delimiter the single fragment stands alone; a bare
/// `+` vanishes.
fn merge_dynamics(first_pass: &[String], i: &mut usize) -> Option<String> {
    let mut content = first_pass[*i][1..].to_string();
    let mut j = *i + 1;
    while j < first_pass.len() && !first_pass[j].starts_with('+') {
        content.push_str(&first_pass[j]);
        j += 1;
    }

    if j < first_pass.len() {
        *i = j;
        if content.trim().is_empty() {
            return None;
        }
        return Some(format!("+{}", content.to_lowercase()));
    }

    // Unclosed marker: keep just the opening fragment, as found.
    let text = first_pass[*i].trim();
    if text.len() > 1 {
        Some(text.to_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(code: &str) -> Vec<String> {
        tokenize(code)
    }

    #[test]
    fn plain_notes_tokenize_one_each() {
        assert_eq!(
            toks("CDEFGABc"),
            vec!["C", "D", "E", "F", "G", "A", "B", "c"]
        );
    }

    #[test]
    fn note_lengths_stay_attached() {
        assert_eq!(toks("C3/2D/2"), vec!["C3/2", "D/2"]);
    }

    #[test]
    fn accidentals_absorb_their_note() {
        assert_eq!(toks("^C_B=e"), vec!["^C", "_B", "=e"]);
        assert_eq!(toks("^^C__B"), vec!["^^C", "__B"]);
    }

    #[test]
    fn bars_and_repeats_merge() {
        assert_eq!(toks("C|D"), vec!["C", "|", "D"]);
        assert_eq!(toks("C|:D:|E"), vec!["C", "|:", "D", ":|", "E"]);
        assert_eq!(toks("C|1D:|2E"), vec!["C", "|1", "D", ":|2", "E"]);
    }

    #[test]
    fn inline_fields_run_to_the_bracket() {
        assert_eq!(toks("C[K:F]D"), vec!["C", "[K:F]", "D"]);
        assert_eq!(toks("[Q:1/4=90]C"), vec!["[Q:1/4=90]", "C"]);
    }

    #[test]
    fn chord_brackets_stay_separate() {
        assert_eq!(toks("[CEG]"), vec!["[", "C", "E", "G", "]"]);
    }

    #[test]
    fn tuplet_markers_merge() {
        assert_eq!(toks("(3CDE"), vec!["(3", "C", "D", "E"]);
    }

    #[test]
    fn quoted_annotations_vanish() {
        assert_eq!(toks("C\"Am7\"D"), vec!["C", "D"]);
    }

    #[test]
    fn dynamics_fold_to_one_token() {
        assert_eq!(toks("+ppp+C"), vec!["+ppp", "C"]);
        assert_eq!(toks("+MF+C"), vec!["+mf", "C"]);
        assert_eq!(toks("+fff+G"), vec!["+fff", "G"]);
    }

    #[test]
    fn bare_plus_vanishes() {
        assert_eq!(toks("++C"), vec!["C"]);
    }

    #[test]
    fn rests_and_ties_pass_through() {
        assert_eq!(toks("z2C-C"), vec!["z2", "C", "-", "C"]);
    }

    #[test]
    fn octave_marks_stay_attached() {
        assert_eq!(toks("c'2C,"), vec!["c'2", "C,"]);
    }
}
