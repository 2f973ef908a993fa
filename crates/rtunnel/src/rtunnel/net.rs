use std::borrow::Cow;

/// Expands the `":PORT"` shorthand used in config files to `"0.0.0.0:PORT"`,
/// which is what `SocketAddr` parsing and Tokio's bind APIs expect.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Drops a trailing `:port` from a Host header value. Bare IPv6 literals are left alone.
pub fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((h, p)) if h.ends_with(']') && p.parse::<u16>().is_ok() => h,
        Some((h, p)) if !h.contains(':') && p.parse::<u16>().is_ok() => h,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_only_binds_all_interfaces() {
        assert_eq!(normalize_bind_addr(":7000").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr(" :9100 ").as_ref(), "0.0.0.0:9100");
        assert_eq!(normalize_bind_addr("127.0.0.1:7000").as_ref(), "127.0.0.1:7000");
        assert_eq!(normalize_bind_addr("[::]:7000").as_ref(), "[::]:7000");
    }

    #[test]
    fn host_header_ports_are_stripped() {
        assert_eq!(strip_port("a.example.com:8080"), "a.example.com");
        assert_eq!(strip_port("a.example.com"), "a.example.com");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("host:notaport"), "host:notaport");
    }
}
