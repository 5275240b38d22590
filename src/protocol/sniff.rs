//! Application-layer hostname sniffing for split routing.
//!
//! When a client CONNECTs to a bare IP on port 80 or 443 the mediator
//! peeks at the first payload bytes for an HTTP `Host:` header or a TLS
//! ClientHello `server_name` extension, so the ACL (and the relay) can
//! see the real hostname.

/// Tri-state sniff outcome. `Incomplete` means the buffered bytes do
/// not yet rule the hostname in or out; the caller keeps accumulating
/// until its probe timer fires.
#[derive(Debug, PartialEq, Eq)]
pub enum Sniff<T> {
    Found(T),
    Incomplete,
    NotFound,
}

/// Extract the `Host:` header from a plaintext HTTP request.
///
/// Headers are scanned up to the terminating blank line; without one
/// the request is still incomplete. A port suffix (`Host: example.com:8080`,
/// `Host: [2001:db8::1]:8080`) is trimmed.
pub fn http_host(data: &[u8]) -> Sniff<String> {
    let mut rest = data;
    loop {
        let Some(pos) = find_crlf(rest) else {
            return Sniff::Incomplete;
        };
        let line = &rest[..pos];
        rest = &rest[pos + 2..];
        if line.is_empty() {
            // End of headers, no Host seen.
            return Sniff::NotFound;
        }
        if let Some(value) = header_value(line, b"host:") {
            match std::str::from_utf8(value) {
                Ok(host) => return Sniff::Found(strip_port(host).to_owned()),
                Err(_) => return Sniff::NotFound,
            }
        }
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if line.len() <= name.len() || !line[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    let mut value = &line[name.len()..];
    while let [b' ' | b'\t', tail @ ..] = value {
        value = tail;
    }
    while let [head @ .., b' ' | b'\t'] = value {
        value = head;
    }
    Some(value)
}

fn strip_port(host: &str) -> &str {
    let bytes = host.as_bytes();
    for i in (0..bytes.len()).rev() {
        match bytes[i] {
            b':' => {
                let trimmed = &host[..i];
                return trimmed
                    .strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .unwrap_or(trimmed);
            }
            b'0'..=b'9' => {}
            _ => break,
        }
    }
    host
}

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const SNI_TYPE_HOSTNAME: u8 = 0x00;

/// Extract the SNI hostname from a TLS ClientHello.
pub fn tls_server_name(data: &[u8]) -> Sniff<String> {
    if data.len() < 5 {
        return Sniff::Incomplete;
    }
    if data[0] != TLS_HANDSHAKE || data[1] != 3 {
        return Sniff::NotFound;
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let have_full_record = data.len() >= 5 + record_len;
    let body = &data[5..data.len().min(5 + record_len)];

    match client_hello_sni(body) {
        Some(Ok(name)) => Sniff::Found(name),
        // Hit the end of the buffered bytes mid-structure: wait, unless
        // the record was complete, in which case it is just malformed.
        None if have_full_record => Sniff::NotFound,
        None => Sniff::Incomplete,
        Some(Err(())) => Sniff::NotFound,
    }
}

/// Walk the ClientHello. `None` = ran out of bytes, `Some(Err)` =
/// structurally not a hello / no SNI, `Some(Ok)` = hostname.
fn client_hello_sni(body: &[u8]) -> Option<Result<String, ()>> {
    let mut cur = Cursor { data: body, pos: 0 };

    if cur.u8()? != TLS_CLIENT_HELLO {
        return Some(Err(()));
    }
    cur.skip(3)?; // handshake length
    cur.skip(2)?; // client version
    cur.skip(32)?; // random
    let session_len = cur.u8()? as usize;
    cur.skip(session_len)?;
    let suites_len = cur.u16()? as usize;
    cur.skip(suites_len)?;
    let compression_len = cur.u8()? as usize;
    cur.skip(compression_len)?;

    let ext_total = cur.u16()? as usize;
    let ext_end = cur.pos.checked_add(ext_total)?;
    while cur.pos + 4 <= ext_end {
        let ext_type = cur.u16()?;
        let ext_len = cur.u16()? as usize;
        if ext_type != EXT_SERVER_NAME {
            cur.skip(ext_len)?;
            continue;
        }
        let list_len = cur.u16()? as usize;
        let list_end = cur.pos.checked_add(list_len)?;
        while cur.pos + 3 <= list_end {
            let name_type = cur.u8()?;
            let name_len = cur.u16()? as usize;
            let name = cur.take(name_len)?;
            if name_type == SNI_TYPE_HOSTNAME {
                return Some(match std::str::from_utf8(name) {
                    Ok(s) => Ok(s.to_owned()),
                    Err(_) => Err(()),
                });
            }
        }
        return Some(Err(()));
    }
    Some(Err(()))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_host_extracted() {
        let req = b"GET / HTTP/1.1\r\nUser-Agent: x\r\nHost: example.com\r\n\r\n";
        assert_eq!(http_host(req), Sniff::Found("example.com".into()));
    }

    #[test]
    fn http_host_case_insensitive_and_port_trimmed() {
        let req = b"GET / HTTP/1.1\r\nhOsT:\texample.com:8080\r\n\r\n";
        assert_eq!(http_host(req), Sniff::Found("example.com".into()));

        let v6 = b"GET / HTTP/1.1\r\nHost: [2001:db8::1]:8080\r\n\r\n";
        assert_eq!(http_host(v6), Sniff::Found("2001:db8::1".into()));
    }

    #[test]
    fn http_incomplete_until_blank_line() {
        assert_eq!(http_host(b"GET / HTTP/1.1\r\nHos"), Sniff::Incomplete);
        // Host already present, header block not terminated: the value
        // is usable without waiting.
        assert_eq!(
            http_host(b"GET / HTTP/1.1\r\nHost: a.example\r\nAccept"),
            Sniff::Found("a.example".into())
        );
        assert_eq!(http_host(b"GET / HTTP/1.1\r\n\r\n"), Sniff::NotFound);
    }

    /// Minimal ClientHello carrying one SNI entry.
    fn client_hello(host: &str) -> Vec<u8> {
        let sni_entry_len = 3 + host.len();
        let ext_len = 2 + sni_entry_len;
        let exts_len = 4 + ext_len;
        let hello_len = 2 + 32 + 1 + 2 + 2 + 1 + 1 + 2 + exts_len;
        let hs_len = 4 + hello_len;

        let mut out = vec![0x16, 0x03, 0x01];
        out.extend_from_slice(&(hs_len as u16).to_be_bytes());
        out.push(0x01);
        out.extend_from_slice(&(hello_len as u32).to_be_bytes()[1..]);
        out.extend_from_slice(&[0x03, 0x03]); // version
        out.extend_from_slice(&[0u8; 32]); // random
        out.push(0); // session id
        out.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
        out.extend_from_slice(&[0x13, 0x01]);
        out.push(1); // compression methods
        out.push(0);
        out.extend_from_slice(&(exts_len as u16).to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // server_name ext
        out.extend_from_slice(&(ext_len as u16).to_be_bytes());
        out.extend_from_slice(&(sni_entry_len as u16).to_be_bytes());
        out.push(0); // hostname entry
        out.extend_from_slice(&(host.len() as u16).to_be_bytes());
        out.extend_from_slice(host.as_bytes());
        out
    }

    #[test]
    fn sni_extracted() {
        let hello = client_hello("example.com");
        assert_eq!(
            tls_server_name(&hello),
            Sniff::Found("example.com".into())
        );
    }

    #[test]
    fn sni_incomplete_on_every_prefix() {
        let hello = client_hello("example.com");
        for cut in 1..hello.len() {
            match tls_server_name(&hello[..cut]) {
                Sniff::Incomplete => {}
                Sniff::Found(ref h) if h == "example.com" => {}
                other => panic!("prefix {cut}: {other:?}"),
            }
        }
    }

    #[test]
    fn non_tls_bytes_rejected_immediately() {
        assert_eq!(tls_server_name(b"GET / HTTP/1.1\r\n\r\n"), Sniff::NotFound);
        assert_eq!(tls_server_name(&[0x17, 0x03, 0x03, 0x00, 0x05]), Sniff::NotFound);
    }

    #[test]
    fn hello_without_sni_is_not_found() {
        let mut hello = client_hello("x");
        // Rewrite the extension type to something else.
        let ext_type_at = hello.len() - (2 + 2 + 2 + 1 + 2 + 1);
        hello[ext_type_at] = 0xff;
        hello[ext_type_at + 1] = 0x01;
        assert_eq!(tls_server_name(&hello), Sniff::NotFound);
    }
}
