// Licensed under the MIT license.

//! Argument formatting and parsing for the AT wire dialect: dotted-quad
//! IPv4, colon-grouped IPv6, colon-paired MAC, and quoted/escaped strings.
//! Every formatter has a matching parser and the pair is an identity on
//! well-formed input.

use crate::error::Error;
use eui48::MacAddress;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Accumulates AT command arguments, handling the leading-comma and quoting
/// rules uniformly so every emit site shares one code path.
#[derive(Default)]
pub struct ArgWriter {
    buf: String,
    first: bool,
}

impl ArgWriter {
    pub fn new() -> Self {
        ArgWriter { buf: String::new(), first: true }
    }

    fn comma(&mut self) {
        if self.first {
            self.first = false;
        } else {
            self.buf.push(',');
        }
    }

    /// Pushes a raw (already-formatted) argument, optionally quoted.
    pub fn push_raw(&mut self, s: &str, quoted: bool) -> &mut Self {
        self.comma();
        if quoted {
            self.buf.push('"');
            escape_into(s, &mut self.buf);
            self.buf.push('"');
        } else {
            self.buf.push_str(s);
        }
        self
    }

    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.push_raw(s, true)
    }

    pub fn push_number(&mut self, n: i64) -> &mut Self {
        self.comma();
        let _ = write!(self.buf, "{}", n);
        self
    }

    pub fn push_ipv4(&mut self, ip: Ipv4Addr) -> &mut Self {
        self.push_raw(&format_ipv4(ip), true)
    }

    pub fn push_ipv6(&mut self, ip: Ipv6Addr) -> &mut Self {
        self.push_raw(&format_ipv6(ip), true)
    }

    pub fn push_mac(&mut self, mac: &MacAddress) -> &mut Self {
        self.push_raw(&format_mac(mac), true)
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

/// Leading-comma insertion rule: iff not the first argument. Exposed
/// standalone for call sites building a suffix by hand.
pub fn leading_comma(is_first: bool) -> &'static str {
    if is_first { "" } else { "," }
}

/// Backslash-escapes `,`, `"` and `\` per the wire format.
pub fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        if c == ',' || c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    escape_into(s, &mut out);
    out
}

/// Reverses [`escape`].
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub fn format_ipv4(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("{}.{}.{}.{}", o[0], o[1], o[2], o[3])
}

pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, Error> {
    s.trim_matches('"')
        .parse()
        .map_err(|_| Error::ParErr { details: "malformed IPv4 address" })
}

pub fn format_ipv6(ip: Ipv6Addr) -> String {
    let seg = ip.segments();
    let parts: Vec<String> = seg.iter().map(|g| format!("{:x}", g)).collect();
    parts.join(":")
}

pub fn parse_ipv6(s: &str) -> Result<Ipv6Addr, Error> {
    let s = s.trim_matches('"');
    let mut groups = [0u16; 8];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 8 {
        return Err(Error::ParErr { details: "malformed IPv6 address" });
    }
    for (i, p) in parts.iter().enumerate() {
        if p.is_empty() || p.len() > 4 {
            return Err(Error::ParErr { details: "malformed IPv6 group" });
        }
        groups[i] = u16::from_str_radix(p, 16)
            .map_err(|_| Error::ParErr { details: "malformed IPv6 group" })?;
    }
    Ok(Ipv6Addr::new(
        groups[0], groups[1], groups[2], groups[3], groups[4], groups[5], groups[6], groups[7],
    ))
}

pub fn format_mac(mac: &MacAddress) -> String {
    let b = mac.to_array();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

pub fn parse_mac(s: &str) -> Result<MacAddress, Error> {
    let s = s.trim_matches('"');
    let mut bytes = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::ParErr { details: "malformed MAC address" });
    }
    for (i, p) in parts.iter().enumerate() {
        bytes[i] = u8::from_str_radix(p, 16).map_err(|_| Error::ParErr { details: "malformed MAC octet" })?;
    }
    Ok(MacAddress::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_roundtrip() {
        let ip: Ipv4Addr = "93.184.216.34".parse().unwrap();
        assert_eq!(parse_ipv4(&format_ipv4(ip)).unwrap(), ip);
    }

    #[test]
    fn ipv6_roundtrip() {
        let ip: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert_eq!(parse_ipv6(&format_ipv6(ip)).unwrap(), ip);
    }

    #[test]
    fn mac_roundtrip() {
        let mac = MacAddress::new([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        assert_eq!(parse_mac(&format_mac(&mac)).unwrap(), mac);
    }

    #[test]
    fn escape_roundtrip() {
        let s = "a,b\"c\\d";
        assert_eq!(unescape(&escape(s)), s);
    }

    #[test]
    fn arg_writer_leading_comma_rule() {
        let mut w = ArgWriter::new();
        w.push_number(0).push_str("TCP").push_number(80);
        assert_eq!(w.finish(), "0,\"TCP\",80");
    }
}
