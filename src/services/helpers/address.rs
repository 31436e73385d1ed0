use mailparse::{MailAddr, MailHeader};

/// Reduce an address to its comparable form: the bare `local@domain`,
/// trimmed and lowercased. `"Alice <Alice@X.org>"` becomes `alice@x.org`.
pub fn normalize_address(addr: &str) -> String {
    let addr = addr.trim();

    if let (Some(start), Some(end)) = (addr.rfind('<'), addr.rfind('>')) {
        if end > start {
            return addr[start + 1..end].trim().to_lowercase();
        }
    }

    addr.trim_matches(|c| c == '<' || c == '>').to_lowercase()
}

pub fn same_address(a: &str, b: &str) -> bool {
    let a = normalize_address(a);
    !a.is_empty() && a == normalize_address(b)
}

/// Addresses of an address-list header (`To`, `Cc`), in header order.
///
/// Groups are flattened. When the header does not parse as an address list
/// the raw value is split on commas instead. Empty entries are dropped.
pub fn header_addresses(header: &MailHeader) -> Vec<String> {
    match mailparse::addrparse_header(header) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![info.addr.clone()],
                MailAddr::Group(group) => group.addrs.iter().map(|i| i.addr.clone()).collect(),
            })
            .map(|a| normalize_address(&a))
            .filter(|a| !a.is_empty())
            .collect(),
        Err(_) => split_addresses(&header.get_value()),
    }
}

/// Comma-split fallback for address lists that do not parse.
pub fn split_addresses(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(normalize_address)
        .filter(|a| !a.is_empty())
        .collect()
}
