//! Chat bubble themes as a lookup table.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Theme {
    #[default]
    Default,
    Superman,
    Hearts,
    Couple,
}

/// ANSI styling for one side of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BubbleStyle {
    /// SGR foreground code.
    pub fg: u8,
    /// SGR background code.
    pub bg: u8,
    /// Drawn on both sides of the bubble.
    pub ornament: Option<&'static str>,
}

struct ThemeStyles {
    own: BubbleStyle,
    other: BubbleStyle,
}

const fn style(fg: u8, bg: u8) -> BubbleStyle {
    BubbleStyle {
        fg,
        bg,
        ornament: None,
    }
}

// Indexed by `Theme as usize`.
const STYLES: [ThemeStyles; 4] = [
    // Default: blue own, light other.
    ThemeStyles {
        own: style(97, 44),
        other: style(30, 47),
    },
    // Superman: yellow own, blue other.
    ThemeStyles {
        own: style(30, 43),
        other: style(97, 104),
    },
    // Hearts: purple own, green other.
    ThemeStyles {
        own: style(97, 45),
        other: style(97, 42),
    },
    // Couple: deep blue own, green other, hearts around both.
    ThemeStyles {
        own: BubbleStyle {
            fg: 97,
            bg: 44,
            ornament: Some("\u{1F495}"),
        },
        other: BubbleStyle {
            fg: 97,
            bg: 42,
            ornament: Some("\u{1F495}"),
        },
    },
];

impl Theme {
    pub const ALL: [Theme; 4] = [Theme::Default, Theme::Superman, Theme::Hearts, Theme::Couple];

    pub fn name(self) -> &'static str {
        match self {
            Theme::Default => "Default",
            Theme::Superman => "Superman",
            Theme::Hearts => "Hearts",
            Theme::Couple => "Couple",
        }
    }

    pub fn bubble(self, own: bool) -> BubbleStyle {
        let styles = &STYLES[self as usize];
        if own {
            styles.own
        } else {
            styles.other
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Theme::ALL
            .into_iter()
            .find(|theme| theme.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown theme: {s}"))
    }
}

impl BubbleStyle {
    pub fn paint(&self, text: &str) -> String {
        let body = format!("\x1b[{};{}m {} \x1b[0m", self.fg, self.bg, text);
        match self.ornament {
            Some(ornament) => format!("{ornament}{body}{ornament}"),
            None => body,
        }
    }
}
