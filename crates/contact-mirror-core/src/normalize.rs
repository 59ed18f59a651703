//! Normalization of raw tax IDs, company names, and emails into comparison keys.
//!
//! Every function here is pure and deterministic: identical input always
//! yields identical output, across processes and snapshot reloads. Index
//! stability depends on that.

/// Country names (lower-case, diacritics folded) accepted as tax-ID hints.
const COUNTRY_TO_ISO: &[(&str, &str)] = &[
    ("poland", "PL"),
    ("polska", "PL"),
    ("estonia", "EE"),
    ("eesti", "EE"),
    ("germany", "DE"),
    ("deutschland", "DE"),
    ("latvia", "LV"),
    ("lithuania", "LT"),
    ("netherlands", "NL"),
    ("ireland", "IE"),
    ("france", "FR"),
    ("spain", "ES"),
    ("italy", "IT"),
    ("portugal", "PT"),
    ("sweden", "SE"),
    ("denmark", "DK"),
    ("finland", "FI"),
    ("austria", "AT"),
    ("czech republic", "CZ"),
    ("czechia", "CZ"),
    ("united kingdom", "GB"),
    ("uk", "GB"),
];

/// Legal-entity suffixes, as token sequences over the normalized name.
/// Longer sequences are listed first so `gmbh co kg` wins over `kg`.
const LEGAL_SUFFIXES: &[&[&str]] = &[
    &["spolka", "z", "ograniczona", "odpowiedzialnoscia"],
    &["spolka", "z", "o", "o"],
    &["gmbh", "co", "kg"],
    &["sp", "z", "o", "o"],
    &["sp", "z", "oo"],
    &["s", "r", "l"],
    &["s", "a", "s"],
    &["b", "v"],
    &["s", "a"],
    &["sp", "zoo"],
    &["sp", "k"],
    &["spzoo"],
    &["limited"],
    &["ltd"],
    &["llc"],
    &["inc"],
    &["corp"],
    &["plc"],
    &["gmbh"],
    &["ag"],
    &["kg"],
    &["sarl"],
    &["sas"],
    &["srl"],
    &["sa"],
    &["bv"],
    &["nv"],
    &["ou"],
    &["oy"],
    &["ab"],
    &["as"],
    &["uab"],
    &["sia"],
];

/// Normalize a tax ID.
///
/// Strips whitespace and punctuation and upper-cases. When the value has no
/// two-letter country prefix and `country_hint` resolves to an ISO code,
/// the code is prepended. Returns `None` for values with nothing left.
pub fn normalize_tax_id(raw: &str, country_hint: Option<&str>) -> Option<String> {
    let cleaned: String = fold_str(raw)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if cleaned.is_empty() {
        return None;
    }
    if has_country_prefix(&cleaned) {
        return Some(cleaned);
    }
    if cleaned.chars().all(|c| c.is_ascii_digit()) {
        if let Some(iso) = country_hint.and_then(country_iso) {
            return Some(format!("{}{}", iso, cleaned));
        }
    }
    Some(cleaned)
}

/// Digits-only form of a normalized tax ID, used for prefix-insensitive lookup.
pub fn tax_id_digits(normalized: &str) -> Option<String> {
    let digits: String = normalized.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// True when the normalized tax ID carries a two-letter country prefix.
pub fn has_country_prefix(normalized: &str) -> bool {
    let bytes = normalized.as_bytes();
    bytes.len() > 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1].is_ascii_alphabetic()
        && bytes[2].is_ascii_digit()
}

/// True when the normalized tax ID starts with letters followed by a digit,
/// whatever the prefix length (`CHE123456789`, `GB123456789`, `EL094014201`).
pub fn has_alpha_prefix(normalized: &str) -> bool {
    let letters = normalized
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .count();
    letters > 0
        && normalized
            .as_bytes()
            .get(letters)
            .is_some_and(|b| b.is_ascii_digit())
}

/// Resolve a country hint (ISO alpha-2 code or a known country name).
pub fn country_iso(hint: &str) -> Option<String> {
    let trimmed = hint.trim();
    if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(trimmed.to_ascii_uppercase());
    }
    let folded = fold_str(&trimmed.to_lowercase());
    COUNTRY_TO_ISO
        .iter()
        .find(|(name, _)| *name == folded)
        .map(|(_, iso)| iso.to_string())
}

/// Normalize a company name into its comparison form.
///
/// Lower-cases, folds common diacritics, turns punctuation into
/// separators, collapses whitespace, and strips trailing legal-entity
/// suffixes (`Sp. z o.o.`, `GmbH`, `Ltd`, ...). A name made only of a
/// suffix keeps it rather than collapsing to an empty key.
pub fn normalize_name(raw: &str) -> String {
    let lowered = fold_str(&raw.to_lowercase());
    let spaced: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let mut tokens: Vec<&str> = spaced.split_whitespace().collect();

    loop {
        let before = tokens.len();
        for suffix in LEGAL_SUFFIXES {
            if tokens.len() > suffix.len() && tokens.ends_with(suffix) {
                tokens.truncate(tokens.len() - suffix.len());
                break;
            }
        }
        if tokens.len() == before {
            break;
        }
    }

    tokens.join(" ")
}

/// Normalize an email address: trimmed and lower-cased. Values that are
/// not shaped like `local@domain` yield `None`.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') || email.contains(' ') {
        return None;
    }
    Some(email)
}

fn fold_str(s: &str) -> String {
    s.chars().map(fold_char).collect()
}

fn fold_char(c: char) -> String {
    let folded = match c {
        'ą' | 'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' | 'ā' => "a",
        'Ą' | 'Á' | 'À' | 'Â' | 'Ä' | 'Ã' | 'Å' | 'Ā' => "A",
        'ć' | 'č' | 'ç' => "c",
        'Ć' | 'Č' | 'Ç' => "C",
        'ę' | 'é' | 'è' | 'ê' | 'ë' | 'ē' | 'ė' => "e",
        'Ę' | 'É' | 'È' | 'Ê' | 'Ë' | 'Ē' | 'Ė' => "E",
        'í' | 'ì' | 'î' | 'ï' | 'ī' | 'į' => "i",
        'Í' | 'Ì' | 'Î' | 'Ï' | 'Ī' | 'Į' => "I",
        'ł' => "l",
        'Ł' => "L",
        'ń' | 'ñ' | 'ņ' => "n",
        'Ń' | 'Ñ' | 'Ņ' => "N",
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'ø' => "o",
        'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' | 'Ø' => "O",
        'ś' | 'š' => "s",
        'Ś' | 'Š' => "S",
        'ú' | 'ù' | 'û' | 'ü' | 'ū' | 'ų' => "u",
        'Ú' | 'Ù' | 'Û' | 'Ü' | 'Ū' | 'Ų' => "U",
        'ź' | 'ż' | 'ž' => "z",
        'Ź' | 'Ż' | 'Ž' => "Z",
        'ß' => "ss",
        _ => return c.to_string(),
    };
    folded.to_string()
}
