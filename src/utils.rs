/// Trims module paths from a `std::any::type_name` string, so that
/// `alloc::string::String` renders as `String` and
/// `my_crate::tags::Sample` renders as `Sample`. Punctuation and nesting
/// are preserved.
pub(crate) fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut ident = String::new();

    for ch in full.chars() {
        if ch.is_alphanumeric() || ch == '_' || ch == ':' {
            ident.push(ch);
        } else {
            flush(&mut out, &mut ident);
            out.push(ch);
        }
    }

    flush(&mut out, &mut ident);
    out
}

fn flush(out: &mut String, ident: &mut String) {
    if !ident.is_empty() {
        out.push_str(ident.rsplit("::").next().unwrap_or(""));
        ident.clear();
    }
}
