//! Title to directory-name normalization.

use deunicode::deunicode_char;

/// Converts free text into a lowercase, ASCII, hyphen-separated slug.
///
/// Non-ASCII letters are transliterated (`Борщ` becomes `borshch`), `&`
/// becomes `and`, apostrophes are dropped, and every other run of
/// non-alphanumeric characters collapses into a single hyphen. The result
/// never starts or ends with a hyphen and may be empty.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_separator = false;

    for c in input.chars() {
        match c {
            '\'' | '\u{2019}' => {}
            '&' => {
                pending_separator = true;
                push_word(&mut slug, &mut pending_separator, "and");
                pending_separator = true;
            }
            c if c.is_ascii() => push_ascii(&mut slug, &mut pending_separator, c),
            c => {
                for folded in deunicode_char(c).unwrap_or_default().chars() {
                    push_ascii(&mut slug, &mut pending_separator, folded);
                }
            }
        }
    }

    slug
}

/// Whether `slug` is already in normalized form.
pub fn is_normalized(slug: &str) -> bool {
    !slug.is_empty() && slugify(slug) == slug
}

fn push_ascii(slug: &mut String, pending_separator: &mut bool, c: char) {
    if c.is_ascii_alphanumeric() {
        push_word(slug, pending_separator, c.to_ascii_lowercase().encode_utf8(&mut [0; 4]));
    } else {
        *pending_separator = true;
    }
}

fn push_word(slug: &mut String, pending_separator: &mut bool, text: &str) {
    if *pending_separator && !slug.is_empty() {
        slug.push('-');
    }
    *pending_separator = false;
    slug.push_str(text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_title() {
        assert_eq!(slugify("Tacos"), "tacos");
        assert_eq!(slugify("Grandma's Apple Pie"), "grandmas-apple-pie");
        assert_eq!(slugify("  Hello,   World!  "), "hello-world");
    }

    #[test]
    fn test_symbols_and_accents() {
        assert_eq!(slugify("Mac & Cheese"), "mac-and-cheese");
        assert_eq!(slugify("Crème Brûlée"), "creme-brulee");
        assert_eq!(slugify("Smørrebrød"), "smorrebrod");
        assert_eq!(slugify("Straße"), "strasse");
    }

    #[test]
    fn test_transliterates_beyond_western_european() {
        assert_eq!(slugify("Döner Kebap Şiş"), "doner-kebap-sis");
        assert_eq!(slugify("İskender"), "iskender");
        assert_eq!(slugify("Gulyás Leves Őszi"), "gulyas-leves-oszi");
        assert_eq!(slugify("Phở Bò"), "pho-bo");
        assert_eq!(slugify("Квас"), "kvas");
        assert_eq!(slugify("Борщ"), "borshch");
    }

    #[test]
    fn test_separators_collapse() {
        assert_eq!(slugify("a--b__c//d"), "a-b-c-d");
        assert_eq!(slugify("---"), "");
        assert_eq!(slugify("../etc/passwd"), "etc-passwd");
    }

    #[test]
    fn test_idempotent() {
        for input in ["Tacos", "Mac & Cheese", "Crème Brûlée", "2024 Recap: Part 1", "Борщ"] {
            let once = slugify(input);
            assert_eq!(slugify(&once), once);
            assert!(is_normalized(&once));
        }
        assert!(!is_normalized("Not Normal"));
        assert!(!is_normalized(""));
    }
}
