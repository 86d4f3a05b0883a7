//! HPACK header compression (RFC 7541).
//!
//! One encoder/decoder pair lives per connection, owned by the writer
//! and reader respectively. The decoder's dynamic table capacity follows
//! our advertised SETTINGS_HEADER_TABLE_SIZE; the encoder follows the
//! peer's, capped locally at 16 384 bytes.

use std::collections::VecDeque;
use std::io;

use bytes::{BufMut, BytesMut};

use super::huffman;

/// The encoder never grows its dynamic table beyond this, whatever the
/// peer advertises.
const ENCODER_TABLE_SIZE_LIMIT: u32 = 16_384;

/// Entry overhead defined by RFC 7541 section 4.1.
const ENTRY_OVERHEAD: usize = 32;

/// The IETF static table, indices 1 through 61.
pub(crate) static STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

fn entry_size(name: &str, value: &str) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

/// A FIFO of dynamic entries; index 62 is the most recently added.
#[derive(Debug, Default)]
struct DynamicTable {
    entries: VecDeque<(String, String)>,
    byte_size: usize,
    max_byte_size: usize,
}

impl DynamicTable {
    fn with_capacity(max_byte_size: usize) -> DynamicTable {
        DynamicTable {
            entries: VecDeque::new(),
            byte_size: 0,
            max_byte_size,
        }
    }

    fn insert(&mut self, name: String, value: String) {
        let size = entry_size(&name, &value);
        if size > self.max_byte_size {
            // Too large to retain: inserting clears the whole table.
            self.entries.clear();
            self.byte_size = 0;
            return;
        }
        self.byte_size += size;
        self.entries.push_front((name, value));
        self.evict_to_fit();
    }

    fn set_max_byte_size(&mut self, max: usize) {
        self.max_byte_size = max;
        self.evict_to_fit();
    }

    fn evict_to_fit(&mut self) {
        while self.byte_size > self.max_byte_size {
            let (name, value) = self.entries.pop_back().expect("table accounting broken");
            self.byte_size -= entry_size(&name, &value);
        }
    }

    fn get(&self, index: usize) -> Option<&(String, String)> {
        self.entries.get(index)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ===== Decoder =====

/// Decodes header blocks from the peer.
pub(crate) struct Decoder {
    dynamic: DynamicTable,
    /// Our advertised SETTINGS_HEADER_TABLE_SIZE: the ceiling for any
    /// dynamic-table-size-update the peer sends.
    max_allowed: usize,
}

impl Decoder {
    pub(crate) fn new(max_table_size: u32) -> Decoder {
        Decoder {
            dynamic: DynamicTable::with_capacity(max_table_size as usize),
            max_allowed: max_table_size as usize,
        }
    }

    /// The current dynamic table size, exposed for invariant tests.
    #[cfg(test)]
    pub(crate) fn dynamic_table_byte_size(&self) -> usize {
        self.dynamic.byte_size
    }

    /// Decodes one complete header block.
    pub(crate) fn decode(&mut self, block: &[u8]) -> io::Result<Vec<(String, String)>> {
        let mut cursor = Cursor { block, pos: 0 };
        let mut out = Vec::new();
        let mut block_started = false;

        while !cursor.is_empty() {
            let byte = cursor.peek()?;
            if byte & 0x80 != 0 {
                // 1xxxxxxx: indexed.
                block_started = true;
                let index = cursor.read_int(7)?;
                let (name, value) = self.lookup(index)?;
                out.push((name, value));
            } else if byte & 0xc0 == 0x40 {
                // 01xxxxxx: literal with incremental indexing.
                block_started = true;
                let index = cursor.read_int(6)?;
                let name = self.read_name(&mut cursor, index)?;
                let value = cursor.read_string()?;
                self.dynamic.insert(name.clone(), value.clone());
                out.push((name, value));
            } else if byte & 0xe0 == 0x20 {
                // 001xxxxx: dynamic table size update; only valid before
                // the first header field of the block.
                if block_started {
                    return Err(invalid("table size update inside header block"));
                }
                let size = cursor.read_int(5)?;
                if size > self.max_allowed {
                    return Err(invalid("table size update exceeds setting"));
                }
                self.dynamic.set_max_byte_size(size);
            } else {
                // 0001xxxx never indexed / 0000xxxx without indexing.
                block_started = true;
                let index = cursor.read_int(4)?;
                let name = self.read_name(&mut cursor, index)?;
                let value = cursor.read_string()?;
                out.push((name, value));
            }
        }
        Ok(out)
    }

    fn lookup(&self, index: usize) -> io::Result<(String, String)> {
        if index == 0 {
            return Err(invalid("indexed header with index 0"));
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.to_string(), value.to_string()));
        }
        self.dynamic
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or_else(|| invalid("indexed header out of range"))
    }

    fn read_name(&self, cursor: &mut Cursor<'_>, index: usize) -> io::Result<String> {
        let name = if index == 0 {
            cursor.read_string()?
        } else {
            self.lookup(index)?.0
        };
        // Field names with uppercase ASCII are malformed in HTTP/2.
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(invalid("uppercase header name"));
        }
        if name.is_empty() {
            return Err(invalid("empty header name"));
        }
        Ok(name)
    }
}

struct Cursor<'a> {
    block: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.block.len()
    }

    fn peek(&self) -> io::Result<u8> {
        self.block
            .get(self.pos)
            .copied()
            .ok_or_else(|| invalid("truncated header block"))
    }

    fn next(&mut self) -> io::Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    /// Prefix-N integer decoding (RFC 7541 section 5.1).
    fn read_int(&mut self, prefix_bits: u32) -> io::Result<usize> {
        let mask = (1u32 << prefix_bits) - 1;
        let mut value = (self.next()? as u32) & mask;
        if value < mask {
            return Ok(value as usize);
        }
        let mut shift = 0u32;
        loop {
            let b = self.next()? as u32;
            value = value
                .checked_add((b & 0x7f) << shift)
                .ok_or_else(|| invalid("integer overflow"))?;
            if b & 0x80 == 0 {
                return Ok(value as usize);
            }
            shift += 7;
            if shift > 28 {
                return Err(invalid("integer too long"));
            }
        }
    }

    fn read_string(&mut self) -> io::Result<String> {
        let huffman_coded = self.peek()? & 0x80 != 0;
        let len = self.read_int(7)?;
        if self.pos + len > self.block.len() {
            return Err(invalid("truncated string literal"));
        }
        let raw = &self.block[self.pos..self.pos + len];
        self.pos += len;
        let bytes = if huffman_coded {
            huffman::decode(raw)?
        } else {
            raw.to_vec()
        };
        String::from_utf8(bytes).map_err(|_| invalid("header is not UTF-8"))
    }
}

// ===== Encoder =====

/// Encodes header blocks for the peer.
pub(crate) struct Encoder {
    dynamic: DynamicTable,
    /// Set when the peer's SETTINGS changed the table ceiling; emitted as
    /// a size update at the start of the next block.
    pending_table_size_update: Option<usize>,
}

impl Encoder {
    pub(crate) fn new() -> Encoder {
        Encoder {
            dynamic: DynamicTable::with_capacity(4096),
            pending_table_size_update: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn dynamic_table_byte_size(&self) -> usize {
        self.dynamic.byte_size
    }

    /// Applies the peer's SETTINGS_HEADER_TABLE_SIZE, bounded by our own
    /// ceiling.
    pub(crate) fn set_peer_max_table_size(&mut self, size: u32) {
        let effective = size.min(ENCODER_TABLE_SIZE_LIMIT) as usize;
        if effective != self.dynamic.max_byte_size {
            self.pending_table_size_update = Some(effective);
            self.dynamic.set_max_byte_size(effective);
        }
    }

    pub(crate) fn encode(&mut self, headers: &[(String, String)], out: &mut BytesMut) {
        if let Some(size) = self.pending_table_size_update.take() {
            write_int(out, 0x20, 5, size);
        }
        for (name, value) in headers {
            self.encode_field(name, value, out);
        }
    }

    fn encode_field(&mut self, name: &str, value: &str, out: &mut BytesMut) {
        if is_sensitive(name) {
            // 0001xxxx: literal never indexed.
            let name_index = self.find_name(name);
            write_int(out, 0x10, 4, name_index);
            if name_index == 0 {
                write_string(out, name);
            }
            write_string(out, value);
            return;
        }

        if let Some(index) = self.find_field(name, value) {
            // 1xxxxxxx: indexed.
            write_int(out, 0x80, 7, index);
            return;
        }

        // 01xxxxxx: literal with incremental indexing.
        let name_index = self.find_name(name);
        write_int(out, 0x40, 6, name_index);
        if name_index == 0 {
            write_string(out, name);
        }
        write_string(out, value);
        self.dynamic.insert(name.to_string(), value.to_string());
    }

    fn find_field(&self, name: &str, value: &str) -> Option<usize> {
        for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
            if *n == name && *v == value {
                return Some(i + 1);
            }
        }
        for i in 0..self.dynamic.len() {
            let (n, v) = self.dynamic.get(i).expect("in range");
            if n == name && v == value {
                return Some(STATIC_TABLE.len() + 1 + i);
            }
        }
        None
    }

    fn find_name(&self, name: &str) -> usize {
        for (i, (n, _)) in STATIC_TABLE.iter().enumerate() {
            if *n == name {
                return i + 1;
            }
        }
        for i in 0..self.dynamic.len() {
            let (n, _) = self.dynamic.get(i).expect("in range");
            if n == name {
                return STATIC_TABLE.len() + 1 + i;
            }
        }
        0
    }
}

/// Headers whose values must never enter a compression table.
fn is_sensitive(name: &str) -> bool {
    matches!(
        name,
        "authorization" | "proxy-authorization" | "cookie" | "set-cookie"
    )
}

fn write_int(out: &mut BytesMut, pattern: u8, prefix_bits: u32, value: usize) {
    let mask = (1usize << prefix_bits) - 1;
    if value < mask {
        out.put_u8(pattern | value as u8);
        return;
    }
    out.put_u8(pattern | mask as u8);
    let mut rest = value - mask;
    while rest >= 0x80 {
        out.put_u8((rest as u8 & 0x7f) | 0x80);
        rest >>= 7;
    }
    out.put_u8(rest as u8);
}

fn write_string(out: &mut BytesMut, s: &str) {
    let raw = s.as_bytes();
    let huffman_len = huffman::encoded_length(raw);
    if huffman_len < raw.len() {
        write_int(out, 0x80, 7, huffman_len);
        huffman::encode(raw, out);
    } else {
        write_int(out, 0x00, 7, raw.len());
        out.put_slice(raw);
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(fields: &[(&str, &str)]) -> Vec<(String, String)> {
        fields
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    // RFC 7541 appendix C.3.1, raw string literals.
    #[test]
    fn decode_rfc_first_request() {
        let block = [
            0x82, 0x86, 0x84, 0x41, 0x0f, 0x77, 0x77, 0x77, 0x2e, 0x65, 0x78, 0x61, 0x6d,
            0x70, 0x6c, 0x65, 0x2e, 0x63, 0x6f, 0x6d,
        ];
        let mut decoder = Decoder::new(4096);
        let headers = decoder.decode(&block).unwrap();
        assert_eq!(
            headers,
            pairs(&[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
            ])
        );
        // :authority was added to the dynamic table (57 bytes).
        assert_eq!(decoder.dynamic_table_byte_size(), 57);
    }

    /// A literal-without-indexing name reference, as used by peers that
    /// do not grow tables.
    #[test]
    fn decode_literal_without_indexing() {
        let block = [
            0x82, 0x86, 0x84, 0x01, 0x0f, 0x77, 0x77, 0x77, 0x2e, 0x65, 0x78, 0x61, 0x6d,
            0x70, 0x6c, 0x65, 0x2e, 0x63, 0x6f, 0x6d,
        ];
        let mut decoder = Decoder::new(4096);
        let headers = decoder.decode(&block).unwrap();
        assert_eq!(headers[3], ("".to_string() + ":authority", "www.example.com".to_string()));
        assert_eq!(decoder.dynamic_table_byte_size(), 0);
    }

    // RFC 7541 appendix C.4.1: same headers, Huffman strings.
    #[test]
    fn encode_rfc_first_request() {
        let mut encoder = Encoder::new();
        let mut out = BytesMut::new();
        encoder.encode(
            &pairs(&[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
            ]),
            &mut out,
        );
        assert_eq!(
            out.to_vec(),
            vec![
                0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b,
                0xa0, 0xab, 0x90, 0xf4, 0xff,
            ]
        );
    }

    #[test]
    fn round_trip_with_matching_tables() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new(4096);
        let blocks: Vec<Vec<(String, String)>> = vec![
            pairs(&[(":method", "GET"), (":path", "/a"), ("x-custom", "one")]),
            pairs(&[(":method", "GET"), (":path", "/a"), ("x-custom", "one")]),
            pairs(&[("x-custom", "two"), ("x-other", "three")]),
            pairs(&[("cookie", "secret=1"), ("x-custom", "two")]),
        ];
        for block in blocks {
            let mut out = BytesMut::new();
            encoder.encode(&block, &mut out);
            let decoded = decoder.decode(&out).unwrap();
            assert_eq!(decoded, block);
            // The decoder reconstructs the encoder's table exactly.
            assert_eq!(
                decoder.dynamic_table_byte_size(),
                encoder.dynamic_table_byte_size()
            );
        }
    }

    #[test]
    fn sensitive_headers_never_indexed() {
        let mut encoder = Encoder::new();
        let mut out = BytesMut::new();
        encoder.encode(&pairs(&[("authorization", "Basic dXNlcg==")]), &mut out);
        // 0001xxxx prefix with static name index 23.
        assert_eq!(out[0], 0x10 | 0x0f);
        assert_eq!(encoder.dynamic_table_byte_size(), 0);
    }

    #[test]
    fn table_size_update_honored() {
        let mut decoder = Decoder::new(4096);
        // Update to 0 evicts everything; then a literal is not retained
        // beyond the 0-byte ceiling.
        let mut block = BytesMut::new();
        write_int(&mut block, 0x20, 5, 0);
        write_int(&mut block, 0x40, 6, 0);
        write_string(&mut block, "x-a");
        write_string(&mut block, "1");
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(decoded, pairs(&[("x-a", "1")]));
        assert_eq!(decoder.dynamic_table_byte_size(), 0);
    }

    #[test]
    fn table_size_update_mid_block_rejected() {
        let mut block = BytesMut::new();
        write_int(&mut block, 0x80, 7, 2); // :method GET
        write_int(&mut block, 0x20, 5, 0); // size update, too late
        let mut decoder = Decoder::new(4096);
        assert!(decoder.decode(&block).is_err());
    }

    #[test]
    fn uppercase_name_rejected() {
        let mut block = BytesMut::new();
        write_int(&mut block, 0x40, 6, 0);
        write_string(&mut block, "X-Bad");
        write_string(&mut block, "v");
        let mut decoder = Decoder::new(4096);
        assert!(decoder.decode(&block).is_err());
    }

    #[test]
    fn update_exceeding_setting_rejected() {
        let mut block = BytesMut::new();
        write_int(&mut block, 0x20, 5, 8192);
        let mut decoder = Decoder::new(4096);
        assert!(decoder.decode(&block).is_err());
    }

    #[test]
    fn eviction_when_full() {
        let mut table = DynamicTable::with_capacity(100);
        table.insert("aaaa".into(), "bbbb".into()); // 40 bytes
        table.insert("cccc".into(), "dddd".into()); // 40 bytes
        table.insert("eeee".into(), "ffff".into()); // 40 bytes; evicts first
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1).unwrap().0, "cccc");
    }
}
