//! Metaphone codes for the phonetic matching tier.
//!
//! Classic Philips metaphone: reduces an English word to a consonant
//! skeleton so spelling variants ("Stephen" / "Stefen") collapse to the
//! same code. Only ASCII letters participate; fold diacritics first.

/// Compute the metaphone code of a string. Non-letters are ignored, so a
/// whole track title encodes as one code.
pub fn metaphone(input: &str) -> String {
    let word: Vec<u8> = input
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase() as u8)
        .collect();
    if word.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    let n = word.len();
    let at = |i: usize| -> u8 {
        if i < n {
            word[i]
        } else {
            0
        }
    };
    let is_vowel = |c: u8| matches!(c, b'A' | b'E' | b'I' | b'O' | b'U');

    // Initial-letter exceptions
    let mut i = match (at(0), at(1)) {
        (b'A', b'E') => 1,                              // AEneas → E...
        (b'G' | b'K' | b'P', b'N') => 1,                // GNome, KNife, PNeumonia
        (b'W', b'R') => 1,                              // WRack
        (b'X', _) => {
            out.push('S'); // Xavier sounds like S
            1
        }
        (b'W', b'H') => {
            out.push('W');
            2
        }
        _ => 0,
    };

    while i < n {
        let c = at(i);

        // Skip doubled letters (except C, which can be CC → KS-ish)
        if i > 0 && c == at(i - 1) && c != b'C' {
            i += 1;
            continue;
        }

        match c {
            b'A' | b'E' | b'I' | b'O' | b'U' => {
                // Vowels only survive at the very start
                if i == 0 {
                    out.push(c as char);
                }
            }
            b'B' => {
                // Silent terminal B after M (laMB)
                if !(i == n - 1 && i > 0 && at(i - 1) == b'M') {
                    out.push('B');
                }
            }
            b'C' => {
                if at(i + 1) == b'H' {
                    // SCH → K, otherwise CH → X
                    if i > 0 && at(i - 1) == b'S' {
                        out.push('K');
                    } else {
                        out.push('X');
                    }
                    i += 1; // consume the H
                } else if at(i + 1) == b'I' && at(i + 2) == b'A' {
                    out.push('X');
                } else if matches!(at(i + 1), b'I' | b'E' | b'Y') {
                    out.push('S');
                } else {
                    out.push('K');
                }
            }
            b'F' => out.push('F'),
            b'D' => {
                if at(i + 1) == b'G' && matches!(at(i + 2), b'E' | b'I' | b'Y') {
                    out.push('J'); // eDGe
                    i += 1;
                } else {
                    out.push('T');
                }
            }
            b'G' => {
                if at(i + 1) == b'H' {
                    if is_vowel(at(i + 2)) {
                        out.push('K'); // GHost-like
                        i += 1;
                    } else {
                        i += 1; // silent GH (niGHt)
                    }
                } else if at(i + 1) == b'N' {
                    // siGN — silent
                } else if matches!(at(i + 1), b'I' | b'E' | b'Y') {
                    out.push('J');
                } else {
                    out.push('K');
                }
            }
            b'H' => {
                // Silent after a vowel unless followed by one
                if i > 0 && is_vowel(at(i - 1)) && !is_vowel(at(i + 1)) {
                    // silent
                } else {
                    out.push('H');
                }
            }
            b'J' => out.push('J'),
            b'K' => {
                // Silent after C (baCK)
                if !(i > 0 && at(i - 1) == b'C') {
                    out.push('K');
                }
            }
            b'L' => out.push('L'),
            b'M' => out.push('M'),
            b'N' => out.push('N'),
            b'P' => {
                if at(i + 1) == b'H' {
                    out.push('F');
                    i += 1;
                } else {
                    out.push('P');
                }
            }
            b'Q' => out.push('K'),
            b'R' => out.push('R'),
            b'S' => {
                if at(i + 1) == b'H' {
                    out.push('X');
                    i += 1;
                } else if at(i + 1) == b'I' && matches!(at(i + 2), b'O' | b'A') {
                    out.push('X'); // confuSIOn
                } else {
                    out.push('S');
                }
            }
            b'T' => {
                if at(i + 1) == b'H' {
                    out.push('0'); // theta
                    i += 1;
                } else if at(i + 1) == b'I' && matches!(at(i + 2), b'O' | b'A') {
                    out.push('X'); // naTIOn
                } else if at(i + 1) == b'C' && at(i + 2) == b'H' {
                    // maTCH — the CH carries the sound
                } else {
                    out.push('T');
                }
            }
            b'V' => out.push('F'),
            b'W' => {
                if is_vowel(at(i + 1)) {
                    out.push('W');
                }
            }
            b'X' => out.push_str("KS"),
            b'Y' => {
                if is_vowel(at(i + 1)) {
                    out.push('Y');
                }
            }
            b'Z' => out.push('S'),
            _ => {}
        }
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spelling_variants_collapse() {
        assert_eq!(metaphone("Stephen"), metaphone("Stefen"));
        assert_eq!(metaphone("night"), metaphone("nite"));
        assert_eq!(metaphone("Caroline"), metaphone("Karoline"));
        assert_eq!(metaphone("Franklin"), metaphone("Phranklin"));
    }

    #[test]
    fn test_f_survives_encoding() {
        assert_eq!(metaphone("Stefen"), "STFN");
        assert_eq!(metaphone("Fire on the Mountain"), metaphone("Phire on the Mountain"));
        assert!(metaphone("Fire").starts_with('F'));
    }

    #[test]
    fn test_initial_exceptions() {
        assert_eq!(metaphone("Knife"), metaphone("Nife"));
        assert_eq!(metaphone("Wrack"), metaphone("Rack"));
        assert!(metaphone("Xavier").starts_with('S'));
    }

    #[test]
    fn test_silent_letters() {
        // Terminal B after M
        assert_eq!(metaphone("lamb"), metaphone("lam"));
        // GN
        assert_eq!(metaphone("sign"), metaphone("sine"));
    }

    #[test]
    fn test_th_and_sh() {
        assert!(metaphone("the").contains('0'));
        assert!(metaphone("ship").starts_with('X'));
    }

    #[test]
    fn test_whole_title_encodes() {
        // Spaces and punctuation are transparent
        assert_eq!(
            metaphone("Eyes of the World"),
            metaphone("eyes-of-the-world!")
        );
        assert!(!metaphone("Dark Star").is_empty());
    }

    #[test]
    fn test_empty_and_non_alpha() {
        assert_eq!(metaphone(""), "");
        assert_eq!(metaphone("12345 --"), "");
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(metaphone("Terrapin Station"), metaphone("Terrapin Station"));
    }
}
