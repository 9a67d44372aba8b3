/// Diagnostic categories, each mapped to one log target.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Category {
    /// Image parsing and segment setup.
    Loader = 0,
    /// Incoming messages.
    Msg = 1,
    /// Replies written back to the guest.
    MsgReply = 2,
    /// Messages and traps nobody handled.
    Unhandled = 3,
    /// Segment reservation, growth and protection changes.
    Segment = 4,
    /// Signal delivery and trap decoding.
    Trap = 5,
}

impl Category {
    pub const ALL: [Self; 6] = [
        Self::Loader,
        Self::Msg,
        Self::MsgReply,
        Self::Unhandled,
        Self::Segment,
        Self::Trap,
    ];

    /// Categories enabled when nothing is configured.
    pub const DEFAULT: [Self; 1] = [Self::Unhandled];

    /// The log target string for this category.
    #[must_use]
    pub const fn target(self) -> &'static str {
        match self {
            Self::Loader => "loader",
            Self::Msg => "msg",
            Self::MsgReply => "msg_reply",
            Self::Unhandled => "unhandled",
            Self::Segment => "segment",
            Self::Trap => "trap",
        }
    }

    /// Look a category up by its target name.
    #[must_use]
    pub fn by_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.target() == name)
    }

    pub(crate) const fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip() {
        for c in Category::ALL {
            assert_eq!(Category::by_name(c.target()), Some(c));
        }
        assert_eq!(Category::by_name("nope"), None);
    }
}
