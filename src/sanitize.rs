// ABOUTME: Scrubs terminal noise out of captured agent output before it reaches the chat surface.
// ABOUTME: ANSI escapes, console style tags, and box-drawing characters; everything else survives.

use regex::Regex;
use std::sync::OnceLock;

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // CSI sequences plus OSC sequences terminated by BEL or ST.
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")
            .expect("ansi regex")
    })
}

fn style_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Console-markup tags ([bold]...[/bold] and friends). A closed name set
    // so user text in brackets is left alone.
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)\[/?(?:
                bold|dim|italic|underline|blink|reverse|strike|
                red|green|yellow|blue|magenta|cyan|white|black|
                bright_(?:red|green|yellow|blue|magenta|cyan|white|black)
            )(?:\x20[^\]]*)?\]",
        )
        .expect("style tag regex")
    })
}

fn is_box_drawing(c: char) -> bool {
    ('\u{2500}'..='\u{257F}').contains(&c)
}

/// Remove ANSI escape sequences, console style tags, and box-drawing
/// characters. All other characters, including newlines, pass through
/// verbatim.
pub fn scrub(text: &str) -> String {
    let without_ansi = ansi_re().replace_all(text, "");
    let without_tags = style_tag_re().replace_all(&without_ansi, "");
    without_tags.chars().filter(|c| !is_box_drawing(*c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_ansi_escapes() {
        assert_eq!(scrub("\x1b[32mgreen\x1b[0m text"), "green text");
        assert_eq!(scrub("\x1b]0;title\x07body"), "body");
    }

    #[test]
    fn removes_style_tags() {
        assert_eq!(scrub("[bold]hi[/bold] there"), "hi there");
        assert_eq!(scrub("[bright_red]x[/bright_red]"), "x");
    }

    #[test]
    fn removes_box_drawing() {
        assert_eq!(scrub("┌─ Bash\n│ ls\n└─ done"), " Bash\n ls\n done");
    }

    #[test]
    fn preserves_everything_else() {
        let text = "plain [not a tag] text\nwith newlines\tand tabs";
        assert_eq!(scrub(text), text);
    }
}
