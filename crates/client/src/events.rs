use strafe::{MuzzleFlash, SoundStart, TempEntity};

/// Decoded server traffic surfaced to the embedding application. Rendering,
/// audio, and UI consume these; they never touch the wire themselves.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    /// Precache finished and frames are flowing.
    EnteredGame,
    Disconnected {
        reason: String,
    },
    Print {
        level: u8,
        text: String,
    },
    CenterPrint {
        text: String,
    },
    /// Stuffed console text the client did not recognize as a
    /// connection-control command.
    Command {
        text: String,
    },
    ConfigString {
        index: u16,
        text: String,
    },
    Layout {
        text: String,
    },
    Sound(SoundStart),
    MuzzleFlash(MuzzleFlash),
    TempEntity(TempEntity),
    Frame {
        tick: u32,
    },
}
