//! Huffman coding for HPACK string literals (RFC 7541 appendix B).

use std::io;
use std::sync::OnceLock;

use bytes::{BufMut, BytesMut};

/// `(code, bit_length)` for symbols 0..=255 plus EOS at index 256.
const CODES: [(u32, u8); 257] = [
    (0x1ff8, 13), (0x7fffd8, 23), (0xfffffe2, 28), (0xfffffe3, 28),
    (0xfffffe4, 28), (0xfffffe5, 28), (0xfffffe6, 28), (0xfffffe7, 28),
    (0xfffffe8, 28), (0xffffea, 24), (0x3ffffffc, 30), (0xfffffe9, 28),
    (0xfffffea, 28), (0x3ffffffd, 30), (0xfffffeb, 28), (0xfffffec, 28),
    (0xfffffed, 28), (0xfffffee, 28), (0xfffffef, 28), (0xffffff0, 28),
    (0xffffff1, 28), (0xffffff2, 28), (0x3ffffffe, 30), (0xffffff3, 28),
    (0xffffff4, 28), (0xffffff5, 28), (0xffffff6, 28), (0xffffff7, 28),
    (0xffffff8, 28), (0xffffff9, 28), (0xffffffa, 28), (0xffffffb, 28),
    (0x14, 6), (0x3f8, 10), (0x3f9, 10), (0xffa, 12),
    (0x1ff9, 13), (0x15, 6), (0xf8, 8), (0x7fa, 11),
    (0x3fa, 10), (0x3fb, 10), (0xf9, 8), (0x7fb, 11),
    (0xfa, 8), (0x16, 6), (0x17, 6), (0x18, 6),
    (0x0, 5), (0x1, 5), (0x2, 5), (0x19, 6),
    (0x1a, 6), (0x1b, 6), (0x1c, 6), (0x1d, 6),
    (0x1e, 6), (0x1f, 6), (0x5c, 7), (0xfb, 8),
    (0x7ffc, 15), (0x20, 6), (0xffb, 12), (0x3fc, 10),
    (0x1ffa, 13), (0x21, 6), (0x5d, 7), (0x5e, 7),
    (0x5f, 7), (0x60, 7), (0x61, 7), (0x62, 7),
    (0x63, 7), (0x64, 7), (0x65, 7), (0x66, 7),
    (0x67, 7), (0x68, 7), (0x69, 7), (0x6a, 7),
    (0x6b, 7), (0x6c, 7), (0x6d, 7), (0x6e, 7),
    (0x6f, 7), (0x70, 7), (0x71, 7), (0x72, 7),
    (0xfc, 8), (0x73, 7), (0xfd, 8), (0x1ffb, 13),
    (0x7fff0, 19), (0x1ffc, 13), (0x3ffc, 14), (0x22, 6),
    (0x7ffd, 15), (0x3, 5), (0x23, 6), (0x4, 5),
    (0x24, 6), (0x5, 5), (0x25, 6), (0x26, 6),
    (0x27, 6), (0x6, 5), (0x74, 7), (0x75, 7),
    (0x28, 6), (0x29, 6), (0x2a, 6), (0x7, 5),
    (0x2b, 6), (0x76, 7), (0x2c, 6), (0x8, 5),
    (0x9, 5), (0x2d, 6), (0x77, 7), (0x78, 7),
    (0x79, 7), (0x7a, 7), (0x7b, 7), (0x7ffe, 15),
    (0x7fc, 11), (0x3ffd, 14), (0x1ffd, 13), (0xffffffc, 28),
    (0xfffe6, 20), (0x3fffd2, 22), (0xfffe7, 20), (0xfffe8, 20),
    (0x3fffd3, 22), (0x3fffd4, 22), (0x3fffd5, 22), (0x7fffd9, 23),
    (0x3fffd6, 22), (0x7fffda, 23), (0x7fffdb, 23), (0x7fffdc, 23),
    (0x7fffdd, 23), (0x7fffde, 23), (0xffffeb, 24), (0x7fffdf, 23),
    (0xffffec, 24), (0xffffed, 24), (0x3fffd7, 22), (0x7fffe0, 23),
    (0xffffee, 24), (0x7fffe1, 23), (0x7fffe2, 23), (0x7fffe3, 23),
    (0x7fffe4, 23), (0x1fffdc, 21), (0x3fffd8, 22), (0x7fffe5, 23),
    (0x3fffd9, 22), (0x7fffe6, 23), (0x7fffe7, 23), (0xffffef, 24),
    (0x3fffda, 22), (0x1fffdd, 21), (0xfffe9, 20), (0x3fffdb, 22),
    (0x3fffdc, 22), (0x7fffe8, 23), (0x7fffe9, 23), (0x1fffde, 21),
    (0x7fffea, 23), (0x3fffdd, 22), (0x3fffde, 22), (0xfffff0, 24),
    (0x1fffdf, 21), (0x3fffdf, 22), (0x7fffeb, 23), (0x7fffec, 23),
    (0x1fffe0, 21), (0x1fffe1, 21), (0x3fffe0, 22), (0x1fffe2, 21),
    (0x7fffed, 23), (0x3fffe1, 22), (0x7fffee, 23), (0x7fffef, 23),
    (0xfffea, 20), (0x3fffe2, 22), (0x3fffe3, 22), (0x3fffe4, 22),
    (0x7ffff0, 23), (0x3fffe5, 22), (0x3fffe6, 22), (0x7ffff1, 23),
    (0x3ffffe0, 26), (0x3ffffe1, 26), (0xfffeb, 20), (0x7fff1, 19),
    (0x3fffe7, 22), (0x7ffff2, 23), (0x3fffe8, 22), (0x1ffffec, 25),
    (0x3ffffe2, 26), (0x3ffffe3, 26), (0x3ffffe4, 26), (0x7ffffde, 27),
    (0x7ffffdf, 27), (0x3ffffe5, 26), (0xfffff1, 24), (0x1ffffed, 25),
    (0x7fff2, 19), (0x1fffe3, 21), (0x3ffffe6, 26), (0x7ffffe0, 27),
    (0x7ffffe1, 27), (0x3ffffe7, 26), (0x7ffffe2, 27), (0xfffff2, 24),
    (0x1fffe4, 21), (0x1fffe5, 21), (0x3ffffe8, 26), (0x3ffffe9, 26),
    (0xffffffd, 28), (0x7ffffe3, 27), (0x7ffffe4, 27), (0x7ffffe5, 27),
    (0xfffec, 20), (0xfffff3, 24), (0xfffed, 20), (0x1fffe6, 21),
    (0x3fffe9, 22), (0x1fffe7, 21), (0x1fffe8, 21), (0x7ffff3, 23),
    (0x3fffea, 22), (0x3fffeb, 22), (0x1ffffee, 25), (0x1ffffef, 25),
    (0xfffff4, 24), (0xfffff5, 24), (0x3ffffea, 26), (0x7ffff4, 23),
    (0x3ffffeb, 26), (0x7ffffe6, 27), (0x3ffffec, 26), (0x3ffffed, 26),
    (0x7ffffe7, 27), (0x7ffffe8, 27), (0x7ffffe9, 27), (0x7ffffea, 27),
    (0x7ffffeb, 27), (0xffffffe, 28), (0x7ffffec, 27), (0x7ffffed, 27),
    (0x7ffffee, 27), (0x7ffffef, 27), (0x7fffff0, 27), (0x3ffffee, 26),
    (0x3fffffff, 30),
];

/// Encodes `input`, padding the final byte with the EOS prefix (all
/// ones).
pub(crate) fn encode(input: &[u8], out: &mut BytesMut) {
    let mut bits: u64 = 0;
    let mut bit_count: u32 = 0;
    for &b in input {
        let (code, len) = CODES[b as usize];
        bits = (bits << len) | code as u64;
        bit_count += len as u32;
        while bit_count >= 8 {
            bit_count -= 8;
            out.put_u8((bits >> bit_count) as u8);
        }
    }
    if bit_count > 0 {
        // Pad with the most significant bits of EOS.
        bits = (bits << (8 - bit_count)) | (0xff >> bit_count) as u64;
        out.put_u8(bits as u8);
    }
}

/// The encoded length of `input` in bytes.
pub(crate) fn encoded_length(input: &[u8]) -> usize {
    let bits: u64 = input.iter().map(|&b| CODES[b as usize].1 as u64).sum();
    ((bits + 7) / 8) as usize
}

/// A flattened binary trie for decoding. Node `n` has children at
/// `2n + bit`; leaves store `symbol + 1`, zero means interior.
struct DecodeTree {
    children: Vec<u32>,
    symbols: Vec<u16>,
}

fn decode_tree() -> &'static DecodeTree {
    static TREE: OnceLock<DecodeTree> = OnceLock::new();
    TREE.get_or_init(|| {
        let mut tree = DecodeTree {
            children: vec![0, 0],
            symbols: vec![0],
        };
        for (symbol, &(code, len)) in CODES.iter().enumerate() {
            let mut node = 0usize;
            for i in (0..len).rev() {
                let bit = ((code >> i) & 1) as usize;
                let slot = node * 2 + bit;
                if tree.children[slot] == 0 {
                    let next = tree.symbols.len() as u32;
                    tree.children[slot] = next;
                    tree.children.push(0);
                    tree.children.push(0);
                    tree.symbols.push(0);
                }
                node = tree.children[slot] as usize;
            }
            tree.symbols[node] = symbol as u16 + 1;
        }
        tree
    })
}

/// Decodes a Huffman-coded string. Padding must be a prefix of EOS and
/// at most 7 bits; a decoded EOS symbol is a protocol error.
pub(crate) fn decode(input: &[u8]) -> io::Result<Vec<u8>> {
    let tree = decode_tree();
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut node = 0usize;
    let mut bits_since_symbol = 0u32;
    let mut all_ones = true;
    for &byte in input {
        for i in (0..8).rev() {
            let bit = ((byte >> i) & 1) as usize;
            node = tree.children[node * 2 + bit] as usize;
            if node == 0 {
                return Err(invalid("invalid huffman code"));
            }
            bits_since_symbol += 1;
            all_ones &= bit == 1;
            let symbol = tree.symbols[node];
            if symbol != 0 {
                if symbol == 257 {
                    return Err(invalid("huffman string contains EOS"));
                }
                out.push((symbol - 1) as u8);
                node = 0;
                bits_since_symbol = 0;
                all_ones = true;
            }
        }
    }
    // An incomplete trailing code must be a short EOS prefix: at most
    // seven bits, all ones.
    if node != 0 && (bits_since_symbol > 7 || !all_ones) {
        return Err(invalid("invalid huffman padding"));
    }
    Ok(out)
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode_vec(input: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode(input, &mut out);
        out.to_vec()
    }

    // RFC 7541 appendix C.4 request examples.
    #[test]
    fn rfc_request_examples() {
        assert_eq!(
            encode_vec(b"www.example.com"),
            [0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff]
        );
        assert_eq!(encode_vec(b"no-cache"), [0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf]);
        assert_eq!(
            encode_vec(b"custom-key"),
            [0x25, 0xa8, 0x49, 0xe9, 0x5b, 0xa9, 0x7d, 0x7f]
        );
        assert_eq!(
            encode_vec(b"custom-value"),
            [0x25, 0xa8, 0x49, 0xe9, 0x5b, 0xb8, 0xe8, 0xb4, 0xbf]
        );
    }

    // RFC 7541 appendix C.6 response examples.
    #[test]
    fn rfc_response_examples() {
        assert_eq!(encode_vec(b"302"), [0x64, 0x02]);
        assert_eq!(encode_vec(b"private"), [0xae, 0xc3, 0x77, 0x1a, 0x4b]);
        assert_eq!(
            encode_vec(b"Mon, 21 Oct 2013 20:13:21 GMT"),
            [
                0xd0, 0x7a, 0xbe, 0x94, 0x10, 0x54, 0xd4, 0x44, 0xa8, 0x20, 0x05, 0x95,
                0x04, 0x0b, 0x81, 0x66, 0xe0, 0x82, 0xa6, 0x2d, 0x1b, 0xff
            ]
        );
    }

    #[test]
    fn round_trips_arbitrary_bytes() {
        let cases: Vec<Vec<u8>> = vec![
            b"".to_vec(),
            b"a".to_vec(),
            b"hello world".to_vec(),
            (0u8..=255).collect(),
            vec![0xff; 33],
            vec![0x00; 33],
            b"Content-Type: text/html; charset=utf-8".to_vec(),
        ];
        for case in cases {
            let encoded = encode_vec(&case);
            assert_eq!(decode(&encoded).unwrap(), case);
        }
    }

    #[test]
    fn encoded_length_matches() {
        for case in [&b"www.example.com"[..], &b"no-cache"[..], &[0u8, 255, 17][..]] {
            assert_eq!(encoded_length(case), encode_vec(case).len());
        }
    }

    #[test]
    fn rejects_bad_padding() {
        // 'a' is 00011 (5 bits); padding with zeros is invalid.
        assert!(decode(&[0b00011_000]).is_err());
        // Correct padding: 00011_111.
        assert_eq!(decode(&[0b00011_111]).unwrap(), b"a");
    }
}
