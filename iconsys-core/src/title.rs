use encoding_rs::SHIFT_JIS;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::IconSysError;

/// Maximum number of characters per title line, counted before conversion.
pub const MAX_LINE_CHARS: usize = 16;

pub const TITLE_OFFSET_DEFAULT: usize = 0xC0;
pub const TITLE_BLOCK_LEN_DEFAULT: usize = 68;
pub const SPLIT_OFFSET_DEFAULT: usize = 0x06;

/// Upper bound for any layout field; icon.sys itself is 964 bytes.
pub const MAX_HEADER_LEN: usize = 0x10000;

/// Offset between printable ASCII (0x21..=0x7E) and its full-width form.
const FULLWIDTH_OFFSET: u32 = 0xFEE0;
const IDEOGRAPHIC_SPACE: char = '\u{3000}';

/// Characters that do not survive the full-width mapping cleanly, replaced
/// before anything else happens to them.
static SUBSTITUTIONS: &[(char, char)] = &[
    ('\'', '\u{2019}'),
    ('-', '\u{30FC}'),
    ('\u{2080}', '\u{FF10}'),
    ('\u{2081}', '\u{FF11}'),
    ('\u{2082}', '\u{FF12}'),
    ('\u{2083}', '\u{FF13}'),
    ('\u{2084}', '\u{FF14}'),
    ('\u{2085}', '\u{FF15}'),
    ('\u{2086}', '\u{FF16}'),
    ('\u{2087}', '\u{FF17}'),
    ('\u{2088}', '\u{FF18}'),
    ('\u{2089}', '\u{FF19}'),
];

/// JIS X 0208 code points that the WHATWG Shift_JIS table files under their
/// CP932 twin. Both sides name the same two bytes.
static JIS_TO_CP932: &[(char, char)] = &[
    ('\u{301C}', '\u{FF5E}'),
    ('\u{2016}', '\u{2225}'),
    ('\u{2212}', '\u{FF0D}'),
    ('\u{00A2}', '\u{FFE0}'),
    ('\u{00A3}', '\u{FFE1}'),
    ('\u{00AC}', '\u{FFE2}'),
];

/// Full-width forms that only exist in the NEC/IBM extension rows. The
/// extension rows are also rejected by lead byte; these are listed so the
/// intent is visible.
static EXTENSION_ONLY: &[char] = &['\u{FF02}', '\u{FF07}', '\u{FFE4}'];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("title block length must be greater than zero")]
    EmptyBlock,

    #[error("{field} reaches past the {limit:#X}-byte header limit")]
    OutOfRange { field: &'static str, limit: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TitleError {
    #[error("line {line} is {len} characters long, the limit is {}", MAX_LINE_CHARS)]
    LineTooLong { line: u8, len: usize },

    #[error("line 1 encodes to {encoded} bytes which exceeds the {block_len}-byte title block")]
    Overflow { encoded: usize, block_len: usize },

    #[error(transparent)]
    Layout(#[from] LayoutError),
}

/// Where the title lives inside an icon.sys header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TitleLayout {
    pub title_offset: usize,
    pub block_len: usize,
    pub split_offset: usize,
}

impl Default for TitleLayout {
    fn default() -> Self {
        Self {
            title_offset: TITLE_OFFSET_DEFAULT,
            block_len: TITLE_BLOCK_LEN_DEFAULT,
            split_offset: SPLIT_OFFSET_DEFAULT,
        }
    }
}

impl TitleLayout {
    pub fn from_json_file(path: &Path) -> crate::Result<Self> {
        let text = fs::read_to_string(path)?;
        let layout: TitleLayout = serde_json::from_str(&text)?;
        layout
            .validate()
            .map_err(|e| IconSysError::Config(e.to_string()))?;
        Ok(layout)
    }

    /// Reject layouts that address nothing or reach past `MAX_HEADER_LEN`.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.block_len == 0 {
            return Err(LayoutError::EmptyBlock);
        }
        match self.title_offset.checked_add(self.block_len) {
            Some(end) if end <= MAX_HEADER_LEN => {}
            _ => {
                return Err(LayoutError::OutOfRange {
                    field: "title block",
                    limit: MAX_HEADER_LEN,
                });
            }
        }
        if self.split_offset >= MAX_HEADER_LEN {
            return Err(LayoutError::OutOfRange {
                field: "split offset",
                limit: MAX_HEADER_LEN,
            });
        }
        Ok(())
    }

    /// Bytes a header needs to hold both the split byte and the block.
    fn required_len(&self) -> usize {
        (self.title_offset + self.block_len).max(self.split_offset + 1)
    }
}

fn substitute(c: char) -> char {
    SUBSTITUTIONS
        .iter()
        .find(|(from, _)| *from == c)
        .map_or(c, |&(_, to)| to)
}

/// Strip accents by keeping the first code point of the canonical
/// decomposition (`é` -> `e`). Multi-mark sequences lose everything but
/// the base.
fn strip_accent(c: char) -> char {
    std::iter::once(c).nfd().next().unwrap_or(c)
}

fn widen(c: char) -> char {
    match c {
        '!'..='~' => char::from_u32(c as u32 + FULLWIDTH_OFFSET).unwrap_or(c),
        ' ' => IDEOGRAPHIC_SPACE,
        _ => c,
    }
}

fn narrow(c: char) -> char {
    match c {
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - FULLWIDTH_OFFSET).unwrap_or(c),
        IDEOGRAPHIC_SPACE => ' ',
        _ => c,
    }
}

/// Convert typed text to the full-width form the memory card browser shows.
pub fn to_fullwidth(text: &str) -> String {
    text.chars()
        .map(substitute)
        .map(strip_accent)
        .map(widen)
        .collect()
}

fn jis_to_cp932(c: char) -> Option<char> {
    if EXTENSION_ONLY.contains(&c) || JIS_TO_CP932.iter().any(|&(_, cp)| cp == c) {
        return None;
    }
    Some(
        JIS_TO_CP932
            .iter()
            .find(|&&(jis, _)| jis == c)
            .map_or(c, |&(_, cp)| cp),
    )
}

fn cp932_to_jis(c: char) -> char {
    JIS_TO_CP932
        .iter()
        .find(|&&(_, cp)| cp == c)
        .map_or(c, |&(jis, _)| jis)
}

/// True for byte sequences inside JIS X 0201 / JIS X 0208: ASCII, half-width
/// katakana, and double-byte codes outside the NEC row (0x87) and the
/// NEC/IBM/user-defined rows (0xED..=0xFC).
fn is_jis_x0208(bytes: &[u8]) -> bool {
    match *bytes {
        [b] => b < 0x80 || (0xA1..=0xDF).contains(&b),
        [lead, _] => lead != 0x87 && !(0xED..=0xFC).contains(&lead),
        _ => false,
    }
}

/// Shift-JIS bytes for one character, `None` if plain JIS X 0208 has no
/// code for it.
fn encode_char(c: char) -> Option<Vec<u8>> {
    let mapped = jis_to_cp932(c)?;
    let mut utf8 = [0u8; 4];
    let (bytes, _, had_errors) = SHIFT_JIS.encode(mapped.encode_utf8(&mut utf8));
    if had_errors || !is_jis_x0208(&bytes) {
        return None;
    }
    Some(bytes.into_owned())
}

pub fn is_shift_jis_encodable(c: char) -> bool {
    encode_char(c).is_some()
}

/// Drop every character that has no Shift-JIS representation.
pub fn sanitize_for_shift_jis(text: &str) -> String {
    text.chars().filter(|&c| is_shift_jis_encodable(c)).collect()
}

/// Full pipeline for one title line: full-width, sanitize, encode.
pub fn encode_line(text: &str) -> Vec<u8> {
    to_fullwidth(text)
        .chars()
        .filter_map(encode_char)
        .flatten()
        .collect()
}

/// Best-effort decode of one stored line back to typeable text.
/// Malformed sequences and codes outside JIS X 0208 are dropped.
pub fn decode_line(bytes: &[u8]) -> String {
    let (text, had_errors) = SHIFT_JIS.decode_without_bom_handling(bytes);
    if had_errors {
        debug!("dropping malformed Shift-JIS sequences in {:02X?}", bytes);
    }
    text.chars()
        .map(cp932_to_jis)
        .filter(|&c| is_shift_jis_encodable(c))
        .map(narrow)
        .collect()
}

/// Raw split byte as stored, 0 when the buffer is too short to hold it.
pub fn read_split(data: &[u8], layout: &TitleLayout) -> u8 {
    data.get(layout.split_offset).copied().unwrap_or(0)
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Read both title lines for display. Never fails: truncated buffers and
/// out-of-range split bytes give whatever text can be recovered.
pub fn decode_titles(data: &[u8], layout: &TitleLayout) -> (String, String) {
    let start = layout.title_offset.min(data.len());
    let end = layout
        .title_offset
        .saturating_add(layout.block_len)
        .min(data.len());
    let block = &data[start..end];

    let split = usize::from(read_split(data, layout))
        .min(layout.block_len)
        .min(block.len());
    let (line1, line2) = block.split_at(split);

    (
        decode_line(until_nul(line1)),
        decode_line(until_nul(line2)),
    )
}

fn check_len(line: u8, text: &str) -> Result<(), TitleError> {
    let len = text.chars().count();
    if len > MAX_LINE_CHARS {
        return Err(TitleError::LineTooLong { line, len });
    }
    Ok(())
}

/// Encode both lines and write the split byte and the title block into
/// `data`, growing it with zeros if it is too short. On error `data` is
/// left untouched; the layout is validated first, so the offset arithmetic
/// below cannot overflow.
pub fn encode_and_patch(
    data: &mut Vec<u8>,
    line1: &str,
    line2: &str,
    layout: &TitleLayout,
) -> Result<(), TitleError> {
    layout.validate()?;
    check_len(1, line1)?;
    check_len(2, line2)?;

    let encoded1 = encode_line(line1);
    let encoded2 = encode_line(line2);

    let split = encoded1.len();
    if split > layout.block_len {
        return Err(TitleError::Overflow {
            encoded: split,
            block_len: layout.block_len,
        });
    }

    let mut block = encoded1;
    block.extend_from_slice(&encoded2);
    block.resize(layout.block_len, 0);

    let needed = layout.required_len();
    if data.len() < needed {
        data.resize(needed, 0);
    }

    data[layout.split_offset] = (split & 0xFF) as u8;
    data[layout.title_offset..layout.title_offset + layout.block_len].copy_from_slice(&block);

    debug!("patched title: split={} block={:02X?}", split, block);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn header() -> Vec<u8> {
        vec![0xAA; 0x200]
    }

    fn block(data: &[u8]) -> &[u8] {
        &data[TITLE_OFFSET_DEFAULT..TITLE_OFFSET_DEFAULT + TITLE_BLOCK_LEN_DEFAULT]
    }

    #[test]
    fn mario_kart_scenario() {
        let layout = TitleLayout::default();
        let mut data = header();
        encode_and_patch(&mut data, "MARIO KART", "SAVE DATA", &layout).unwrap();

        assert_eq!(data[SPLIT_OFFSET_DEFAULT], 20);
        let b = block(&data);
        assert_eq!(&b[..4], &[0x82, 0x6C, 0x82, 0x60]);
        assert_eq!(&b[10..12], &[0x81, 0x40]);
        assert_eq!(&b[20..22], &[0x82, 0x72]);
        assert_eq!(b[37], 0x60);
        assert!(b[38..].iter().all(|&x| x == 0));

        let (l1, l2) = decode_titles(&data, &layout);
        assert_eq!(l1, "MARIO KART");
        assert_eq!(l2, "SAVE DATA");
    }

    #[test]
    fn cafe_scenario_keeps_every_character() {
        assert_eq!(to_fullwidth("CAFÉ-9"), "ＣＡＦＥー９");
        assert_eq!(
            encode_line("CAFÉ-9"),
            vec![0x82, 0x62, 0x82, 0x60, 0x82, 0x65, 0x82, 0x64, 0x81, 0x5B, 0x82, 0x58]
        );
    }

    #[test]
    fn empty_first_line_starts_block_with_second() {
        let layout = TitleLayout::default();
        let mut data = header();
        encode_and_patch(&mut data, "", "X", &layout).unwrap();

        assert_eq!(data[SPLIT_OFFSET_DEFAULT], 0);
        assert_eq!(&block(&data)[..3], &[0x82, 0x77, 0x00]);
        assert_eq!(decode_titles(&data, &layout), (String::new(), "X".to_string()));
    }

    #[test]
    fn empty_title_zero_fills_block() {
        let mut data = header();
        encode_and_patch(&mut data, "", "", &TitleLayout::default()).unwrap();
        assert_eq!(data[SPLIT_OFFSET_DEFAULT], 0);
        assert!(block(&data).iter().all(|&x| x == 0));
    }

    #[test]
    fn substitutions_apply() {
        assert_eq!(to_fullwidth("IT'S"), "ＩＴ\u{2019}Ｓ");
        assert_eq!(to_fullwidth("H\u{2082}O"), "Ｈ２Ｏ");
        assert_eq!(encode_line("'"), vec![0x81, 0x66]);
    }

    #[test]
    fn ascii_round_trip_is_exact() {
        let layout = TitleLayout::default();
        let samples = [
            ("Hello, World!", "(1/2) #save@?"),
            ("ABCDEFGHIJKLMNOP", "abcdefghijklmnop"),
            ("0123456789", "{[<%&*+=>]}"),
            ("a.b_c", "x;y:z/|`^$"),
        ];
        for (a, b) in samples {
            let mut data = header();
            encode_and_patch(&mut data, a, b, &layout).unwrap();
            assert_eq!(usize::from(data[layout.split_offset]), encode_line(a).len());
            assert_eq!(decode_titles(&data, &layout), (a.to_string(), b.to_string()));
        }
    }

    #[test]
    fn unencodable_characters_are_dropped() {
        assert!(!is_shift_jis_encodable('\u{1F600}'));
        assert_eq!(sanitize_for_shift_jis("Ａ\u{1F600}Ｂ"), "ＡＢ");
        assert_eq!(encode_line("A\u{1F600}B"), encode_line("AB"));

        let layout = TitleLayout::default();
        let mut data = header();
        encode_and_patch(&mut data, "GO\u{1F600}", "", &layout).unwrap();
        assert_eq!(data[layout.split_offset], 4);
        assert_eq!(decode_titles(&data, &layout).0, "GO");
    }

    #[test]
    fn decomposition_keeps_only_base_character() {
        assert_eq!(to_fullwidth("セーブ"), "セーフ");
        assert_eq!(encode_line("セ"), vec![0x83, 0x5A]);
    }

    #[test]
    fn line_too_long_is_per_line() {
        let layout = TitleLayout::default();
        let mut data = header();
        let seventeen = "A".repeat(17);
        let sixteen = "A".repeat(16);

        assert_eq!(
            encode_and_patch(&mut data, &seventeen, "", &layout),
            Err(TitleError::LineTooLong { line: 1, len: 17 })
        );
        assert_eq!(
            encode_and_patch(&mut data, "", &seventeen, &layout),
            Err(TitleError::LineTooLong { line: 2, len: 17 })
        );
        assert_eq!(data, header());

        encode_and_patch(&mut data, &sixteen, &sixteen, &layout).unwrap();
        assert_eq!(data[layout.split_offset], 32);
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let mut data = header();
        let accented = "É".repeat(16);
        encode_and_patch(&mut data, &accented, "", &TitleLayout::default()).unwrap();
    }

    #[test]
    fn overflow_leaves_buffer_untouched() {
        let layout = TitleLayout {
            block_len: 10,
            ..TitleLayout::default()
        };
        let mut data = header();
        let err = encode_and_patch(&mut data, "ABCDEF", "", &layout).unwrap_err();
        assert_eq!(
            err,
            TitleError::Overflow {
                encoded: 12,
                block_len: 10
            }
        );
        assert_eq!(data, header());
    }

    #[test]
    fn combined_overflow_truncates_second_line() {
        let layout = TitleLayout {
            block_len: 10,
            ..TitleLayout::default()
        };
        let mut data = header();
        encode_and_patch(&mut data, "ABC", "DEFG", &layout).unwrap();
        assert_eq!(data[layout.split_offset], 6);
        assert_eq!(&data[0xC0..0xCA], &encode_line("ABCDE")[..]);
        assert_eq!(data[0xCA], 0xAA);
        assert_eq!(decode_titles(&data, &layout), ("ABC".to_string(), "DE".to_string()));
    }

    #[test]
    fn short_buffer_grows_with_zeros() {
        let layout = TitleLayout::default();
        let mut data = vec![0x11; 4];
        encode_and_patch(&mut data, "A", "B", &layout).unwrap();

        assert_eq!(data.len(), 0xC0 + 68);
        assert_eq!(&data[..4], &[0x11; 4]);
        assert_eq!(data[4], 0);
        assert_eq!(data[6], 2);
        assert_eq!(&data[0xC0..0xC4], &[0x82, 0x60, 0x82, 0x61]);
    }

    #[test]
    fn buffer_never_shrinks() {
        let mut data = vec![0x33; 0x400];
        encode_and_patch(&mut data, "A", "B", &TitleLayout::default()).unwrap();
        assert_eq!(data.len(), 0x400);
        assert_eq!(data[0x3FF], 0x33);
    }

    #[test]
    fn split_offset_beyond_block_grows_buffer() {
        let layout = TitleLayout {
            title_offset: 0,
            block_len: 4,
            split_offset: 10,
        };
        let mut data = Vec::new();
        encode_and_patch(&mut data, "A", "", &layout).unwrap();
        assert_eq!(data.len(), 11);
        assert_eq!(data[10], 2);
    }

    #[test]
    fn decode_clamps_corrupt_split() {
        let layout = TitleLayout::default();
        let mut data = header();
        encode_and_patch(&mut data, "AB", "CD", &layout).unwrap();
        data[layout.split_offset] = 0xFF;
        assert_eq!(decode_titles(&data, &layout), ("ABCD".to_string(), String::new()));
    }

    #[test]
    fn decode_short_buffers() {
        let layout = TitleLayout::default();
        assert_eq!(decode_titles(&[], &layout), (String::new(), String::new()));
        assert_eq!(decode_titles(&[0; 3], &layout), (String::new(), String::new()));

        let mut data = header();
        encode_and_patch(&mut data, "AB", "CD", &layout).unwrap();
        data.truncate(0xC0 + 6);
        assert_eq!(decode_titles(&data, &layout), ("AB".to_string(), "C".to_string()));
    }

    #[test]
    fn decode_drops_malformed_sequences() {
        let text = decode_line(&[0x82, 0x60, 0x82]);
        assert_eq!(text, "A");
        assert!(!decode_line(&[0xFF, 0xFF, 0x82, 0x61]).contains(char::REPLACEMENT_CHARACTER));
    }

    #[test]
    fn decode_stops_at_nul_in_each_line() {
        let layout = TitleLayout::default();
        let mut data = vec![0; 0x104];
        data[layout.split_offset] = 4;
        data[0xC0..0xC4].copy_from_slice(&[0x82, 0x60, 0x00, 0x41]);
        data[0xC4..0xC7].copy_from_slice(&[0x82, 0x61, 0x00]);
        assert_eq!(decode_titles(&data, &layout), ("A".to_string(), "B".to_string()));
    }

    #[test]
    fn encodes_only_the_jis_x0208_set() {
        assert_eq!(encode_line("\""), Vec::<u8>::new());
        assert_eq!(encode_line("~"), Vec::<u8>::new());
        assert_eq!(encode_line("\u{A2}"), vec![0x81, 0x91]);
        assert_eq!(encode_line("\u{A3}"), vec![0x81, 0x92]);
        assert_eq!(encode_line("\u{AC}"), vec![0x81, 0xCA]);
        assert_eq!(encode_line("A\"B~C"), encode_line("ABC"));
    }

    #[test]
    fn cp932_only_code_points_are_dropped() {
        for c in ['\u{FF5E}', '\u{FFE0}', '\u{FFE2}', '\u{2225}', '\u{FF02}', '\u{2460}'] {
            assert!(!is_shift_jis_encodable(c), "{c:?} should be dropped");
        }
        assert!(is_shift_jis_encodable('\u{301C}'));
        assert!(is_shift_jis_encodable('\u{2016}'));
        assert_eq!(encode_line("\u{301C}"), vec![0x81, 0x60]);
        assert_eq!(sanitize_for_shift_jis("\u{A2}\u{FFE0}"), "\u{A2}");
    }

    #[test]
    fn decode_shows_jis_code_points() {
        assert_eq!(decode_line(&[0x81, 0x91, 0x81, 0xCA]), "\u{A2}\u{AC}");
        assert_eq!(decode_line(&[0x81, 0x60]), "\u{301C}");
        assert_eq!(decode_line(&[0xFA, 0x57, 0x82, 0x60, 0x87, 0x40]), "A");
        assert_eq!(decode_line(&[0x80, 0x41]), "A");
    }

    #[test]
    fn layout_validation_rejects_out_of_range_fields() {
        assert_eq!(TitleLayout::default().validate(), Ok(()));
        let zero = TitleLayout {
            block_len: 0,
            ..TitleLayout::default()
        };
        assert_eq!(zero.validate(), Err(LayoutError::EmptyBlock));

        for layout in [
            TitleLayout {
                title_offset: usize::MAX,
                ..TitleLayout::default()
            },
            TitleLayout {
                block_len: usize::MAX,
                ..TitleLayout::default()
            },
            TitleLayout {
                title_offset: MAX_HEADER_LEN - 4,
                ..TitleLayout::default()
            },
            TitleLayout {
                split_offset: usize::MAX,
                ..TitleLayout::default()
            },
        ] {
            assert!(matches!(
                layout.validate(),
                Err(LayoutError::OutOfRange { .. })
            ));
        }
    }

    #[test]
    fn huge_offsets_fail_without_touching_buffer() {
        let layout = TitleLayout {
            title_offset: usize::MAX,
            ..TitleLayout::default()
        };
        let mut data = header();
        let err = encode_and_patch(&mut data, "A", "B", &layout).unwrap_err();
        assert!(matches!(err, TitleError::Layout(LayoutError::OutOfRange { .. })));
        assert_eq!(data, header());

        let split = TitleLayout {
            split_offset: usize::MAX,
            ..TitleLayout::default()
        };
        assert!(encode_and_patch(&mut data, "A", "B", &split).is_err());
        assert_eq!(data, header());

        assert_eq!(decode_titles(&data, &layout), (String::new(), String::new()));
        assert_eq!(decode_titles(&data, &split).0, String::new());
    }

    #[test]
    fn read_split_defaults_to_zero() {
        let layout = TitleLayout::default();
        assert_eq!(read_split(&[1, 2, 3], &layout), 0);
        assert_eq!(read_split(&[0, 0, 0, 0, 0, 0, 9], &layout), 9);
    }
}
