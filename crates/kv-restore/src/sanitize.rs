// Store errors can echo user-controlled keys and values back to us; they end up in
// persisted task records and terminal output, so strip anything a terminal interprets.

const MAX_ERROR_CHARS: usize = 512;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    // OSC/DCS style strings run until BEL or ESC '\'.
    Str { saw_esc: bool },
}

pub fn sanitize_error_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_ERROR_CHARS));
    let mut escape: Option<Escape> = None;
    let mut kept = 0usize;

    for c in input.chars() {
        if let Some(state) = escape {
            escape = match state {
                Escape::Start => match c {
                    '[' => Some(Escape::Csi),
                    ']' | 'P' | 'X' | '^' | '_' => Some(Escape::Str { saw_esc: false }),
                    _ => None,
                },
                Escape::Csi if ('@'..='~').contains(&c) => None,
                Escape::Csi => Some(Escape::Csi),
                Escape::Str { .. } if c == '\x07' => None,
                Escape::Str { saw_esc: true } if c == '\\' => None,
                Escape::Str { .. } => Some(Escape::Str {
                    saw_esc: c == '\x1b',
                }),
            };
            continue;
        }

        match c {
            '\x1b' => escape = Some(Escape::Start),
            '\t' | '\n' | '\r' => {
                if !out.ends_with(' ') {
                    out.push(' ');
                    kept += 1;
                }
            }
            c if c.is_control() || is_bidi_control(c) => {}
            c => {
                out.push(c);
                kept += 1;
            }
        }

        if kept >= MAX_ERROR_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out.trim().to_string()
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
