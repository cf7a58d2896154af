//! Key signatures and accidentals for ABC.
//!
//! Two static tables drive resolution: the fifteen canonical keys with
//! their default accidentals per tone letter, and an alias table folding
//! minor, modal and `Maj` spellings onto those keys. Free-form `K:` field
//! text is parsed with a structured pattern: tonic, optional mode word,
//! optional explicit accidental list. Resolution never fails; anything
//! unrecognizable falls back to the key of no accidentals.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Semitone offsets per tone letter, as resolved for one key.
pub type AccidentalMap = HashMap<char, i32>;

/// Default accidentals for each canonical key.
pub static ACCIDENTALS: Lazy<HashMap<&'static str, AccidentalMap>> = Lazy::new(|| {
    fn acc(pairs: &[(char, i32)]) -> AccidentalMap {
        pairs.iter().copied().collect()
    }
    HashMap::from([
        ("C", acc(&[])),
        (
            "C#",
            acc(&[
                ('F', 1),
                ('C', 1),
                ('G', 1),
                ('D', 1),
                ('A', 1),
                ('E', 1),
                ('B', 1),
            ]),
        ),
        (
            "F#",
            acc(&[('F', 1), ('C', 1), ('G', 1), ('D', 1), ('A', 1), ('E', 1)]),
        ),
        ("B", acc(&[('F', 1), ('C', 1), ('G', 1), ('D', 1), ('A', 1)])),
        ("E", acc(&[('F', 1), ('C', 1), ('G', 1), ('D', 1)])),
        ("A", acc(&[('F', 1), ('C', 1), ('G', 1)])),
        ("D", acc(&[('F', 1), ('C', 1)])),
        ("G", acc(&[('F', 1)])),
        (
            "Cb",
            acc(&[
                ('F', -1),
                ('C', -1),
                ('G', -1),
                ('D', -1),
                ('A', -1),
                ('E', -1),
                ('B', -1),
            ]),
        ),
        (
            "Gb",
            acc(&[
                ('C', -1),
                ('G', -1),
                ('D', -1),
                ('A', -1),
                ('E', -1),
                ('B', -1),
            ]),
        ),
        (
            "Db",
            acc(&[('G', -1), ('D', -1), ('A', -1), ('E', -1), ('B', -1)]),
        ),
        ("Ab", acc(&[('D', -1), ('A', -1), ('E', -1), ('B', -1)])),
        ("Eb", acc(&[('A', -1), ('E', -1), ('B', -1)])),
        ("Bb", acc(&[('E', -1), ('B', -1)])),
        ("F", acc(&[('B', -1)])),
    ])
});

/// Alias spellings folded onto canonical keys. Minor keys, the church
/// modes and explicit `Maj` names all land here.
pub static KEY_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("A#m", "C#"),
        ("G#Mix", "C#"),
        ("D#Dor", "C#"),
        ("E#Phr", "C#"),
        ("F#Lyd", "C#"),
        ("B#Loc", "C#"),
        ("D#m", "F#"),
        ("C#Mix", "F#"),
        ("G#Dor", "F#"),
        ("A#Phr", "F#"),
        ("BLyd", "F#"),
        ("E#Loc", "F#"),
        ("G#m", "B"),
        ("F#Mix", "B"),
        ("C#Dor", "B"),
        ("D#Phr", "B"),
        ("ELyd", "B"),
        ("A#Loc", "B"),
        ("C#m", "E"),
        ("BMix", "E"),
        ("F#Dor", "E"),
        ("G#Phr", "E"),
        ("ALyd", "E"),
        ("D#Loc", "E"),
        ("F#m", "A"),
        ("EMix", "A"),
        ("BDor", "A"),
        ("C#Phr", "A"),
        ("DLyd", "A"),
        ("G#Loc", "A"),
        ("Bm", "D"),
        ("AMix", "D"),
        ("EDor", "D"),
        ("F#Phr", "D"),
        ("GLyd", "D"),
        ("C#Loc", "D"),
        ("Em", "G"),
        ("DMix", "G"),
        ("ADor", "G"),
        ("BPhr", "G"),
        ("CLyd", "G"),
        ("F#Loc", "G"),
        ("Am", "C"),
        ("GMix", "C"),
        ("DDor", "C"),
        ("EPhr", "C"),
        ("FLyd", "C"),
        ("BLoc", "C"),
        ("Dm", "F"),
        ("CMix", "F"),
        ("GDor", "F"),
        ("APhr", "F"),
        ("BbLyd", "F"),
        ("ELoc", "F"),
        ("Gm", "Bb"),
        ("FMix", "Bb"),
        ("CDor", "Bb"),
        ("DPhr", "Bb"),
        ("EbLyd", "Bb"),
        ("ALoc", "Bb"),
        ("Cm", "Eb"),
        ("BbMix", "Eb"),
        ("FDor", "Eb"),
        ("GPhr", "Eb"),
        ("AbLyd", "Eb"),
        ("DLoc", "Eb"),
        ("Fm", "Ab"),
        ("EbMix", "Ab"),
        ("BbDor", "Ab"),
        ("CPhr", "Ab"),
        ("DbLyd", "Ab"),
        ("GLoc", "Ab"),
        ("Bbm", "Db"),
        ("AbMix", "Db"),
        ("EbDor", "Db"),
        ("FPhr", "Db"),
        ("GbLyd", "Db"),
        ("CLoc", "Db"),
        ("Ebm", "Gb"),
        ("DbMix", "Gb"),
        ("AbDor", "Gb"),
        ("BbPhr", "Gb"),
        ("CbLyd", "Gb"),
        ("FLoc", "Gb"),
        ("Abm", "Cb"),
        ("GbMix", "Cb"),
        ("DbDor", "Cb"),
        ("EbPhr", "Cb"),
        ("FbLyd", "Cb"),
        ("BbLoc", "Cb"),
        ("AMaj", "A"),
        ("BMaj", "B"),
        ("CMaj", "C"),
        ("DMaj", "D"),
        ("EMaj", "E"),
        ("FMaj", "F"),
        ("GMaj", "G"),
        ("A#Maj", "A"),
        ("B#Maj", "B"),
        ("C#Maj", "C"),
        ("D#Maj", "D"),
        ("E#Maj", "E"),
        ("F#Maj", "F"),
        ("G#Maj", "G"),
    ])
});

static KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^
        (?P<tonic>[A-Ga-g])(?P<acc>\#|[bB])?
        \s*
        (?P<mode>(?i:maj|min|ion|aeo|mix|dor|phr|lyd|loc|exp)[A-Za-z]*|[mM])?
        \s*
        (?P<over>(?:(?:__|\^\^|_|=|\^)\s*[A-Ga-g]\s*)*)
        $",
    )
    .expect("key pattern compiles")
});

static OVERRIDE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(__|\^\^|_|=|\^)\s*([A-Ga-g])").expect("override pattern compiles"));

/// Resolves a name through the alias table (applied twice, since an alias
/// may itself name an alias) down to a canonical key.
fn resolve(name: &str) -> Option<&'static str> {
    let mut name = name;
    if let Some(&alias) = KEY_ALIASES.get(name) {
        name = alias;
    }
    if let Some(&alias) = KEY_ALIASES.get(name) {
        name = alias;
    }
    ACCIDENTALS.get_key_value(name).map(|(key, _)| *key)
}

/// Parses free-form key field text.
///
/// Returns the canonical key name, any explicit accidental overrides from
/// a trailing list like `^F _B`, and whether the mode was `exp`. In
/// explicit mode the override list is the complete accidental set and the
/// key contributes nothing to sounding pitches. Unresolvable input falls
/// back to `C` with no overrides.
pub fn parse(text: &str) -> (&'static str, AccidentalMap, bool) {
    let trimmed = text.trim();

    if let Some(key) = resolve(trimmed) {
        return (key, AccidentalMap::new(), false);
    }

    let caps = match KEY_RE.captures(trimmed) {
        Some(caps) => caps,
        None => {
            log::warn!("unrecognized key field {:?}, falling back to C", trimmed);
            return ("C", AccidentalMap::new(), false);
        }
    };

    let mut tonic = caps["tonic"].to_ascii_uppercase();
    if caps.name("acc").is_some() {
        // The flat letter may arrive in either case.
        match &caps["acc"] {
            "#" => tonic.push('#'),
            _ => tonic.push('b'),
        }
    }

    let mode = caps
        .name("mode")
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    let mode_prefix = if mode.len() >= 3 {
        &mode[..3]
    } else {
        mode.as_str()
    };

    // Candidate alias suffixes for the mode. Major tries the bare tonic
    // first so flat keys hit the canonical table directly, then the
    // explicit Maj spelling that covers the sharp enharmonics.
    let (suffixes, explicit_mode): (&[&str], bool) = match mode_prefix {
        "" => (&[""], false),
        "m" => (&["m"], false),
        "maj" | "ion" => (&["", "Maj"], false),
        "min" | "aeo" => (&["m"], false),
        "mix" => (&["Mix"], false),
        "dor" => (&["Dor"], false),
        "phr" => (&["Phr"], false),
        "lyd" => (&["Lyd"], false),
        "loc" => (&["Loc"], false),
        "exp" => (&[""], true),
        _ => (&[""], false),
    };

    let overrides = parse_overrides(&caps["over"]);

    for suffix in suffixes {
        if let Some(key) = resolve(&format!("{tonic}{suffix}")) {
            return (key, overrides, explicit_mode);
        }
    }

    log::warn!("unresolvable key {:?}, falling back to C", trimmed);
    ("C", overrides, explicit_mode)
}

fn parse_overrides(text: &str) -> AccidentalMap {
    let mut map = AccidentalMap::new();
    for caps in OVERRIDE_RE.captures_iter(text) {
        let offset = match &caps[1] {
            "__" => -2,
            "_" => -1,
            "=" => 0,
            "^" => 1,
            _ => 2,
        };
        let letter = caps[2].to_ascii_uppercase().chars().next();
        if let Some(letter) = letter {
            map.insert(letter, offset);
        }
    }
    map
}

/// The fully resolved tone-to-offset map for a key field: the explicit
/// list alone in `exp` mode, otherwise the key's defaults overlaid with
/// the explicit list.
pub fn get_accidentals(text: &str) -> AccidentalMap {
    let (key, overrides, explicit_mode) = parse(text);
    if explicit_mode {
        return overrides;
    }
    modify_accidentals(key, &overrides)
}

/// Overlays explicit accidentals on a key's defaults.
pub fn modify_accidentals(key: &str, overrides: &AccidentalMap) -> AccidentalMap {
    let mut map = ACCIDENTALS.get(key).cloned().unwrap_or_default();
    for (&letter, &offset) in overrides {
        map.insert(letter, offset);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn canonical_keys_resolve_to_themselves() {
        for &key in ACCIDENTALS.keys() {
            let (resolved, overrides, explicit) = parse(key);
            assert_eq!(resolved, key);
            assert!(overrides.is_empty());
            assert!(!explicit);
        }
    }

    #[test]
    fn aliases_round_trip_to_their_canonical_accidentals() {
        for (&alias, &canonical) in KEY_ALIASES.iter() {
            assert_eq!(
                get_accidentals(alias),
                get_accidentals(canonical),
                "alias {alias} vs canonical {canonical}"
            );
        }
    }

    #[test]
    fn mode_words_fold_to_aliases() {
        assert_eq!(parse("A minor").0, "C");
        assert_eq!(parse("Am").0, "C");
        assert_eq!(parse("G mixolydian").0, "C");
        assert_eq!(parse("D dorian").0, "C");
        assert_eq!(parse("E phrygian").0, "C");
        assert_eq!(parse("F lydian").0, "C");
        assert_eq!(parse("B locrian").0, "C");
        assert_eq!(parse("C major").0, "C");
        assert_eq!(parse("C ionian").0, "C");
        assert_eq!(parse("F# mixolydian").0, "B");
        assert_eq!(parse("Bb minor").0, "Db");
    }

    #[test]
    fn sharp_majors_fold_through_maj_aliases() {
        // C# and F# are canonical keys in their own right.
        assert_eq!(parse("C# major").0, "C#");
        assert_eq!(parse("F# maj").0, "F#");
        // The rest of the sharp majors only exist as Maj alias spellings.
        assert_eq!(parse("A# major").0, "A");
        assert_eq!(parse("B# maj").0, "B");
    }

    #[test]
    fn case_and_whitespace_are_ignored() {
        assert_eq!(get_accidentals("  aM  "), get_accidentals("Am"));
        assert_eq!(get_accidentals("f# MIXOLYDIAN"), get_accidentals("F#Mix"));
        assert_eq!(get_accidentals("eB LyD"), get_accidentals("EbLyd"));
    }

    #[test]
    fn explicit_mode_returns_exactly_the_overrides() {
        let (key, overrides, explicit) = parse("D exp ^F _B __G");
        assert_eq!(key, "D");
        assert!(explicit);
        assert_eq!(
            overrides,
            AccidentalMap::from([('F', 1), ('B', -1), ('G', -2)])
        );
        assert_eq!(get_accidentals("D exp ^F _B __G"), overrides);
    }

    #[test]
    fn overrides_merge_on_top_of_key_defaults() {
        let accidentals = get_accidentals("F ^C");
        assert_eq!(accidentals.get(&'B'), Some(&-1));
        assert_eq!(accidentals.get(&'C'), Some(&1));
    }

    #[test]
    fn override_markers_cover_all_five_forms() {
        let accidentals = get_accidentals("C exp __A _B =C ^D ^^E");
        assert_eq!(
            accidentals,
            AccidentalMap::from([('A', -2), ('B', -1), ('C', 0), ('D', 1), ('E', 2)])
        );
    }

    #[test]
    fn later_overrides_win() {
        let accidentals = get_accidentals("C exp ^F _F");
        assert_eq!(accidentals, AccidentalMap::from([('F', -1)]));
    }

    #[test]
    fn garbage_falls_back_to_c() {
        assert_eq!(parse("").0, "C");
        assert_eq!(parse("H#").0, "C");
        assert_eq!(parse("123").0, "C");
        assert!(get_accidentals("!!nonsense!!").is_empty());
    }

    #[test]
    fn unresolvable_tonic_keeps_overrides() {
        // Fb is not a real key; the explicit list still applies on top of
        // the C fallback.
        let accidentals = get_accidentals("Fb ^C");
        assert_eq!(accidentals.get(&'C'), Some(&1));
    }
}
