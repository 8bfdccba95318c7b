//! IBM code page 437 codec for 8.3 short names (spec §6, `encoding` option).
//!
//! LFN text is always UCS-2 regardless of this option; only the 11-byte
//! short name is affected. Characters outside the printable ASCII range
//! that also lack a CP437 mapping fold to `_` per spec §4.3.

/// Unicode scalar values for CP437 code points 0x80-0xFF, in order.
const HIGH_HALF: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å', 'É', 'æ', 'Æ',
    'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ', 'á', 'í', 'ó', 'ú', 'ñ', 'Ñ',
    'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»', '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕',
    '╣', '║', '╗', '╝', '╜', '╛', '┐', '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦',
    '╠', '═', '╬', '╧', '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐',
    '▀', 'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩', '≡', '±',
    '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{00A0}',
];

/// Encodes `c` to a CP437 byte, if representable.
pub fn encode(c: char) -> Option<u8> {
    if c.is_ascii() {
        return Some(c as u8);
    }
    HIGH_HALF
        .iter()
        .position(|&h| h == c)
        .map(|i| (i + 0x80) as u8)
}

/// Decodes a CP437 byte to its Unicode scalar value.
pub fn decode(b: u8) -> char {
    if b < 0x80 {
        b as char
    } else {
        HIGH_HALF[(b - 0x80) as usize]
    }
}
