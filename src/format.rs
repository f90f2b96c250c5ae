//! Printf-style rendering of recorder entries into fixed stack buffers.
//!
//! Argument slots are word-sized, so the conversion specifier decides how a
//! slot is recovered: floating conversions reinterpret the word as the
//! platform's slot-width float, string conversions treat it as a pointer to
//! a NUL-terminated string, everything else is an integer. Formatting never
//! allocates, so the synchronous trace path stays async-signal safe.

use std::ffi::CStr;
use std::fmt;

use crate::chans::ChanType;
use crate::recorder::{Entry, ENTRY_ARGS};

/// Cursor over a caller-supplied byte buffer. Output past the capacity is
/// silently dropped, like `snprintf` into a local array.
pub(crate) struct Buf<'a> {
    out: &'a mut [u8],
    len: usize,
    cap: usize,
}

impl<'a> Buf<'a> {
    pub(crate) fn new(out: &'a mut [u8]) -> Self {
        let cap = out.len();
        Buf { out, len: 0, cap }
    }

    /// Keep `reserve` bytes usable only through [`Buf::push_reserved`].
    fn with_reserve(out: &'a mut [u8], reserve: usize) -> Self {
        let cap = out.len().saturating_sub(reserve);
        Buf { out, len: 0, cap }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.out[..self.len]
    }

    fn full(&self) -> bool {
        self.len >= self.cap
    }

    fn last(&self) -> Option<u8> {
        self.len.checked_sub(1).map(|i| self.out[i])
    }

    fn push(&mut self, b: u8) {
        if self.len < self.cap {
            self.out[self.len] = b;
            self.len += 1;
        }
    }

    fn push_reserved(&mut self, b: u8) {
        if self.len < self.out.len() {
            self.out[self.len] = b;
            self.len += 1;
        }
    }

    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }
}

impl fmt::Write for Buf<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_bytes(s.as_bytes());
        Ok(())
    }
}

#[derive(Default)]
struct Spec {
    left: bool,
    plus: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
    conv: u8,
}

enum Parsed {
    Spec(Spec),
    Percent,
    Unsupported,
}

/// Parse one conversion after a `%`, advancing `i` past it. Length
/// modifiers are accepted and ignored: every integer slot is one word.
fn parse_spec(fmt: &[u8], i: &mut usize) -> Parsed {
    let mut spec = Spec::default();
    let mut in_precision = false;
    loop {
        if *i >= fmt.len() {
            return Parsed::Unsupported;
        }
        let c = fmt[*i];
        *i += 1;
        match c {
            b'%' => return Parsed::Percent,
            b'-' => spec.left = true,
            b'+' => spec.plus = true,
            b'.' => {
                in_precision = true;
                spec.precision = Some(0);
            }
            b'0'..=b'9' => {
                let d = (c - b'0') as usize;
                if in_precision {
                    spec.precision = Some(spec.precision.unwrap_or(0) * 10 + d);
                } else if c == b'0' && spec.width == 0 {
                    spec.zero = true;
                } else {
                    spec.width = spec.width * 10 + d;
                }
            }
            b'l' | b'L' | b'h' | b'j' | b't' | b'z' | b'q' | b'v' => {}
            b'f' | b'F' | b'g' | b'G' | b'e' | b'E' | b'a' | b'A' | b'b' | b'c' | b'C'
            | b's' | b'S' | b'd' | b'D' | b'i' | b'o' | b'O' | b'u' | b'U' | b'x' | b'X'
            | b'p' => {
                spec.conv = c;
                return Parsed::Spec(spec);
            }
            // %n, %* and anything unrecognised abort this entry.
            _ => return Parsed::Unsupported,
        }
    }
}

fn is_float_conv(conv: u8) -> bool {
    matches!(
        conv,
        b'f' | b'F' | b'g' | b'G' | b'e' | b'E' | b'a' | b'A'
    )
}

#[cfg(target_pointer_width = "64")]
fn word_to_float(word: usize) -> f64 {
    f64::from_bits(word as u64)
}

#[cfg(target_pointer_width = "32")]
fn word_to_float(word: usize) -> f64 {
    f32::from_bits(word as u32) as f64
}

fn unsigned_digits(tmp: &mut [u8; 64], mut v: usize, base: usize, upper: bool) -> usize {
    let digits: &[u8; 16] = if upper {
        b"0123456789ABCDEF"
    } else {
        b"0123456789abcdef"
    };
    let mut at = tmp.len();
    loop {
        at -= 1;
        tmp[at] = digits[v % base];
        v /= base;
        if v == 0 {
            break;
        }
    }
    at
}

fn emit_padded(buf: &mut Buf, sign: Option<u8>, body: &[u8], spec: &Spec, zero_ok: bool) {
    let total = body.len() + sign.is_some() as usize;
    let pad = spec.width.saturating_sub(total);
    if spec.left {
        if let Some(s) = sign {
            buf.push(s);
        }
        buf.push_bytes(body);
        for _ in 0..pad {
            buf.push(b' ');
        }
    } else if spec.zero && zero_ok {
        if let Some(s) = sign {
            buf.push(s);
        }
        for _ in 0..pad {
            buf.push(b'0');
        }
        buf.push_bytes(body);
    } else {
        for _ in 0..pad {
            buf.push(b' ');
        }
        if let Some(s) = sign {
            buf.push(s);
        }
        buf.push_bytes(body);
    }
}

fn render_arg(buf: &mut Buf, spec: &Spec, word: usize) {
    use fmt::Write as _;

    let mut tmp = [0u8; 64];
    if is_float_conv(spec.conv) {
        let v = word_to_float(word);
        let mut fbuf = Buf::new(&mut tmp);
        let _ = match (spec.conv, spec.precision) {
            (b'e', p) => write!(fbuf, "{:.*e}", p.unwrap_or(6), v),
            (b'E', p) => write!(fbuf, "{:.*E}", p.unwrap_or(6), v),
            (b'f' | b'F', p) => write!(fbuf, "{:.*}", p.unwrap_or(6), v),
            (_, Some(p)) => write!(fbuf, "{:.*}", p, v),
            (_, None) => write!(fbuf, "{}", v),
        };
        let len = fbuf.len();
        emit_padded(buf, None, &tmp[..len], spec, true);
        return;
    }

    match spec.conv {
        b'd' | b'D' | b'i' => {
            let v = word as isize;
            let at = unsigned_digits(&mut tmp, v.unsigned_abs(), 10, false);
            let sign = if v < 0 {
                Some(b'-')
            } else if spec.plus {
                Some(b'+')
            } else {
                None
            };
            emit_padded(buf, sign, &tmp[at..], spec, true);
        }
        b'u' | b'U' => {
            let at = unsigned_digits(&mut tmp, word, 10, false);
            emit_padded(buf, None, &tmp[at..], spec, true);
        }
        b'o' | b'O' => {
            let at = unsigned_digits(&mut tmp, word, 8, false);
            emit_padded(buf, None, &tmp[at..], spec, true);
        }
        b'x' => {
            let at = unsigned_digits(&mut tmp, word, 16, false);
            emit_padded(buf, None, &tmp[at..], spec, true);
        }
        b'X' => {
            let at = unsigned_digits(&mut tmp, word, 16, true);
            emit_padded(buf, None, &tmp[at..], spec, true);
        }
        b'b' => {
            let at = unsigned_digits(&mut tmp, word, 2, false);
            emit_padded(buf, None, &tmp[at..], spec, true);
        }
        b'p' => {
            let at = unsigned_digits(&mut tmp, word, 16, false);
            tmp[at - 2] = b'0';
            tmp[at - 1] = b'x';
            emit_padded(buf, None, &tmp[at - 2..], spec, true);
        }
        b'c' | b'C' => {
            let body = [word as u8];
            emit_padded(buf, None, &body, spec, false);
        }
        b's' | b'S' => {
            let bytes: &[u8] = if word == 0 {
                b"<NULL>"
            } else {
                // Contract of the record surface: a %s slot holds a valid
                // NUL-terminated string of stable lifetime.
                unsafe { CStr::from_ptr(word as *const libc::c_char).to_bytes() }
            };
            let bytes = match spec.precision {
                Some(p) if p < bytes.len() => &bytes[..p],
                _ => bytes,
            };
            emit_padded(buf, None, bytes, spec, false);
        }
        _ => {}
    }
}

/// Render one entry's message into `out`, returning the length used. A
/// trailing newline is appended when the format did not end in one.
pub(crate) fn format_entry_message(entry: &Entry, out: &mut [u8]) -> usize {
    let fmt = entry.format.as_bytes();
    let mut buf = Buf::with_reserve(out, 1);
    let mut i = 0;
    let mut arg = 0;

    while i < fmt.len() && arg < ENTRY_ARGS && !buf.full() {
        let c = fmt[i];
        i += 1;
        if c != b'%' {
            buf.push(c);
            continue;
        }
        match parse_spec(fmt, &mut i) {
            Parsed::Percent => buf.push(b'%'),
            Parsed::Unsupported => break,
            Parsed::Spec(spec) => {
                let word = entry.args[arg];
                arg += 1;
                render_arg(&mut buf, &spec, word);
            }
        }
    }

    if buf.last() != Some(b'\n') {
        buf.push_reserved(b'\n');
    }
    buf.len()
}

/// Infer the export type of the `index`-th conversion in a format string.
pub(crate) fn type_from_format(format: &str, index: usize) -> ChanType {
    let fmt = format.as_bytes();
    let mut i = 0;
    let mut remaining = index;
    while i < fmt.len() {
        if fmt[i] != b'%' {
            i += 1;
            continue;
        }
        i += 1;
        match parse_spec(fmt, &mut i) {
            Parsed::Percent => {}
            Parsed::Unsupported => return ChanType::Invalid,
            Parsed::Spec(spec) => {
                let t = if is_float_conv(spec.conv) {
                    ChanType::Real
                } else if matches!(spec.conv, b'b' | b'd' | b'D' | b'i') {
                    ChanType::Signed
                } else {
                    ChanType::Unsigned
                };
                if remaining == 0 {
                    return t;
                }
                remaining -= 1;
            }
        }
    }
    ChanType::Invalid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RecordArg;

    fn message(format: &'static str, args: &[usize]) -> String {
        let mut entry = Entry {
            format,
            ..Entry::default()
        };
        let n = args.len().min(ENTRY_ARGS);
        entry.args[..n].copy_from_slice(&args[..n]);
        let mut out = [0u8; 256];
        let len = format_entry_message(&entry, &mut out);
        String::from_utf8_lossy(&out[..len]).into_owned()
    }

    #[test]
    fn test_integers() {
        assert_eq!(message("%d", &[42]), "42\n");
        assert_eq!(message("%d", &[(-7isize) as usize]), "-7\n");
        assert_eq!(message("%u", &[42]), "42\n");
        assert_eq!(message("%x", &[255]), "ff\n");
        assert_eq!(message("%X", &[255]), "FF\n");
        assert_eq!(message("%o", &[8]), "10\n");
        assert_eq!(message("%b", &[5]), "101\n");
        assert_eq!(message("value=%ld end", &[99]), "value=99 end\n");
    }

    #[test]
    fn test_width_and_flags() {
        assert_eq!(message("%5d", &[42]), "   42\n");
        assert_eq!(message("%-5d|", &[42]), "42   |\n");
        assert_eq!(message("%05d", &[42]), "00042\n");
        assert_eq!(message("%+d", &[42]), "+42\n");
        assert_eq!(message("%05d", &[(-42isize) as usize]), "-0042\n");
    }

    #[test]
    fn test_float_recovery() {
        assert_eq!(message("%.2f", &[RecordArg::to_word(1.5f64)]), "1.50\n");
        assert_eq!(message("%f", &[RecordArg::to_word(0.25f64)]), "0.250000\n");
    }

    #[test]
    fn test_strings() {
        assert_eq!(message("%s", &[0]), "<NULL>\n");
        let s: &'static std::ffi::CStr = c"hello";
        assert_eq!(message("%s!", &[RecordArg::to_word(s)]), "hello!\n");
        assert_eq!(message("%.3s", &[RecordArg::to_word(s)]), "hel\n");
    }

    #[test]
    fn test_percent_and_unsupported() {
        assert_eq!(message("100%%", &[]), "100%\n");
        // %n aborts the entry at that point.
        assert_eq!(message("before %n after", &[1]), "before \n");
        assert_eq!(message("a %* b", &[1]), "a \n");
    }

    #[test]
    fn test_truncates_at_max_args() {
        assert_eq!(message("%d %d %d %d %d", &[1, 2, 3, 4]), "1 2 3 4\n");
    }

    #[test]
    fn test_trailing_newline_not_duplicated() {
        assert_eq!(message("done\n", &[]), "done\n");
    }

    #[test]
    fn test_type_inference() {
        assert_eq!(type_from_format("%d", 0), ChanType::Signed);
        assert_eq!(type_from_format("%u items", 0), ChanType::Unsigned);
        assert_eq!(type_from_format("%.2f", 0), ChanType::Real);
        assert_eq!(type_from_format("%s=%ld", 1), ChanType::Signed);
        assert_eq!(type_from_format("%d", 1), ChanType::Invalid);
        assert_eq!(type_from_format("100%% of %u", 0), ChanType::Unsigned);
    }
}
