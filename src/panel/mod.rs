pub mod buffer;
pub mod controller;
pub mod interface;

pub use buffer::{BufferError, PanelBuffer, PanelColor, RowHalf};
pub use controller::{
    PanelController, PanelGeometry, PanelSession, PanelState, PanelTiming, RenderOutcome,
    StopFlag,
};
pub use interface::{
    BusEvent, BusEventKind, BusLog, ChipSelect, InterfaceError, PanelInterface,
    SimulatedInterface,
};

/// Panel command bytes.
pub mod command {
    pub const POWER_OFF: u8 = 0x02;
    pub const POWER_ON: u8 = 0x04;
    pub const DEEP_SLEEP: u8 = 0x07;
    pub const DATA_START: u8 = 0x10;
    pub const DISPLAY_REFRESH: u8 = 0x12;

    pub const DEEP_SLEEP_CHECK: u8 = 0xA5;
}
