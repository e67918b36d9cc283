/// Cleans raw OCR output before it reaches the scorer.
///
/// Pure and idempotent: `normalize(normalize(x)) == normalize(x)`. Empty output is valid.
pub(crate) fn normalize(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");

    let mut mapped = String::with_capacity(unified.len());
    for ch in unified.chars() {
        map_char(ch, &mut mapped);
    }

    let mut output = String::with_capacity(mapped.len());
    let mut pending_blank = false;
    for line in mapped.split('\n') {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            pending_blank = !output.is_empty();
            continue;
        }

        if !output.is_empty() {
            output.push('\n');
            if pending_blank {
                output.push('\n');
            }
        }
        output.push_str(&collapsed);
        pending_blank = false;
    }

    output
}

fn map_char(ch: char, out: &mut String) {
    match ch {
        '\n' => out.push('\n'),
        '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{FFFD}' | '\u{00AD}' => {}
        '\u{E000}'..='\u{F8FF}' => {}
        '\u{FB00}' => out.push_str("ff"),
        '\u{FB01}' => out.push_str("fi"),
        '\u{FB02}' => out.push_str("fl"),
        '\u{FB03}' => out.push_str("ffi"),
        '\u{FB04}' => out.push_str("ffl"),
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => out.push('\''),
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => out.push('"'),
        '\u{2010}'..='\u{2015}' | '\u{2212}' => out.push('-'),
        '\u{2026}' => out.push_str("..."),
        c if c.is_whitespace() => out.push(' '),
        c if c.is_control() => {}
        c => out.push(c),
    }
}
