// Address-annotated hex view of reconstructed memory
use std::fmt::Write;

const BYTES_PER_LINE: usize = 16;

/// Render `data` as `addr: hex bytes |ascii|` lines, the first byte being at
/// virtual address `base`.
pub fn hexdump(base: u64, data: &[u8]) -> String {
    let mut out = String::new();

    for (i, line) in data.chunks(BYTES_PER_LINE).enumerate() {
        let addr = base.wrapping_add((i * BYTES_PER_LINE) as u64);
        let _ = write!(out, "{:016x}: ", addr);

        for col in 0..BYTES_PER_LINE {
            match line.get(col) {
                Some(b) => {
                    let _ = write!(out, "{:02x} ", b);
                }
                None => out.push_str("   "),
            }
            if col == 7 {
                out.push(' ');
            }
        }

        out.push('|');
        out.extend(line.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }

    out
}
