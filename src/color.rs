//! Color handling for process prefixes and control messages.
//!
//! Converts hex and named colors into ANSI escapes, strips escapes for
//! pattern matching, and hands out palette colors for processes that did not
//! pick one themselves.

/// A 24-bit color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Default prefix palette, assigned round-robin to processes without an
/// explicit `color`.
pub const PALETTE: [Rgb; 8] = [
    Rgb { r: 0x11, g: 0xa8, b: 0xcd }, // cyan
    Rgb { r: 0x0d, g: 0xbc, b: 0x79 }, // green
    Rgb { r: 0xe5, g: 0xe5, b: 0x10 }, // yellow
    Rgb { r: 0x24, g: 0x72, b: 0xc8 }, // blue
    Rgb { r: 0xbc, g: 0x3f, b: 0xbc }, // magenta
    Rgb { r: 0xff, g: 0x88, b: 0x00 }, // orange
    Rgb { r: 0x9b, g: 0x59, b: 0xb6 }, // purple
    Rgb { r: 0xcd, g: 0x31, b: 0x31 }, // red
];

/// Returns the palette color for the given process index.
pub fn palette_color(index: usize) -> Rgb {
    PALETTE[index % PALETTE.len()]
}

/// Parses `#rrggbb` or one of the basic color names.
pub fn parse_color(value: &str) -> Option<Rgb> {
    if let Some(hex) = value.strip_prefix('#') {
        return parse_hex(hex);
    }
    named_color(value)
}

fn parse_hex(hex: &str) -> Option<Rgb> {
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some(Rgb { r, g, b })
}

/// Resolves a basic color name to its RGB value.
pub fn named_color(name: &str) -> Option<Rgb> {
    let hex = match name.to_lowercase().as_str() {
        "black" => "000000",
        "red" => "cd3131",
        "green" => "0dbc79",
        "yellow" => "e5e510",
        "blue" => "2472c8",
        "magenta" => "bc3fbc",
        "cyan" => "11a8cd",
        "white" => "e5e5e5",
        "gray" | "grey" => "666666",
        "orange" => "ff8800",
        "purple" => "9b59b6",
        _ => return None,
    };
    parse_hex(hex)
}

/// ANSI truecolor foreground escape for `color`.
pub fn fg(color: Rgb) -> String {
    format!("\u{1b}[38;2;{};{};{}m", color.r, color.g, color.b)
}

/// Wraps `text` in a truecolor foreground escape.
pub fn paint(text: &str, color: Rgb) -> String {
    format!("{}{}\u{1b}[0m", fg(color), text)
}

/// Dim rendition, used for the `$ command` echo line.
pub fn dim(text: &str) -> String {
    format!("\u{1b}[2m{}\u{1b}[0m", text)
}

/// Yellow rendition, used for restart notices.
pub fn yellow(text: &str) -> String {
    format!("\u{1b}[33m{}\u{1b}[0m", text)
}

/// Red rendition, used for failure notices.
pub fn red(text: &str) -> String {
    format!("\u{1b}[31m{}\u{1b}[0m", text)
}

/// Removes ANSI escape sequences, replacing invalid UTF-8.
pub fn strip_ansi(text: &str) -> String {
    let stripped = strip_ansi_escapes::strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_colors() {
        assert_eq!(
            parse_color("#ff0080"),
            Some(Rgb { r: 0xff, g: 0x00, b: 0x80 })
        );
        assert_eq!(parse_color("#ff008"), None);
        assert_eq!(parse_color("#gg0080"), None);
    }

    #[test]
    fn parses_named_colors() {
        assert!(parse_color("red").is_some());
        assert!(parse_color("Grey").is_some());
        assert_eq!(parse_color("gray"), parse_color("grey"));
        assert!(parse_color("orange").is_some());
        assert!(parse_color("chartreuse").is_none());
    }

    #[test]
    fn paint_emits_truecolor_escape() {
        let painted = paint("x", Rgb { r: 1, g: 2, b: 3 });
        assert_eq!(painted, "\u{1b}[38;2;1;2;3mx\u{1b}[0m");
    }

    #[test]
    fn strip_ansi_removes_escapes() {
        assert_eq!(strip_ansi("\u{1b}[31mred\u{1b}[0m plain"), "red plain");
        assert_eq!(strip_ansi("no escapes"), "no escapes");
    }

    #[test]
    fn palette_wraps_around() {
        assert_eq!(palette_color(0), palette_color(PALETTE.len()));
    }
}
