//! Case-insensitive helpers over header lists kept as plain string pairs.

pub fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn header_set(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    header_remove(headers, name);
    headers.push((name.to_string(), value.to_string()));
}

pub fn header_remove(headers: &mut Vec<(String, String)>, name: &str) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
}
