//! READY and remote-control status word decoding
//!
//! The controller reports both words as (possibly signed) decimal numbers;
//! they are masked to 16 bits before any bit is inspected.

use std::fmt;

use crate::Function;

/// Raw READY word that means "all off" under FUNCTION 195, whatever its bits say
pub const READY_ALL_OFF_195: u16 = 65532;

/// Channel A active flag in the READY word under FUNCTION 196
const READY_196_A_BIT: u16 = 14;
/// Channel B active flag in the READY word under FUNCTION 196
const READY_196_B_BIT: u16 = 15;
/// Channel A ok flag in the READY word under FUNCTION 195
const READY_195_A_BIT: u16 = 8;
/// Channel B ok flag in the READY word under FUNCTION 195
const READY_195_B_BIT: u16 = 7;

/// PIN15 (actuator energized) flag in the RC:S word
const PIN15_BIT: u16 = 6;
/// PIN6 flag in the RC:S word
const PIN6_BIT: u16 = 3;

/// Mask a raw console number to an unsigned 16-bit word
pub fn mask_word(raw: f64) -> u16 {
    ((raw as i64) & 0xFFFF) as u16
}

fn bit(word: u16, n: u16) -> bool {
    word & (1 << n) != 0
}

/// Which output channels are actively driving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReadyStatus {
    #[cfg_attr(feature = "serde", serde(rename = "A ACTIVE"))]
    AActive,
    #[cfg_attr(feature = "serde", serde(rename = "B ACTIVE"))]
    BActive,
    #[cfg_attr(feature = "serde", serde(rename = "A + B ACTIVE"))]
    BothActive,
    #[cfg_attr(feature = "serde", serde(rename = "ALL OFF"))]
    AllOff,
}

impl ReadyStatus {
    fn from_flags(a: bool, b: bool) -> Self {
        match (a, b) {
            (true, true) => ReadyStatus::BothActive,
            (true, false) => ReadyStatus::AActive,
            (false, true) => ReadyStatus::BActive,
            (false, false) => ReadyStatus::AllOff,
        }
    }

    /// Decode a masked READY word for the given firmware function
    pub fn decode(word: u16, function: Function) -> Self {
        match function {
            Function::Dual => {
                Self::from_flags(bit(word, READY_196_A_BIT), bit(word, READY_196_B_BIT))
            }
            Function::Single => {
                if word == READY_ALL_OFF_195 {
                    ReadyStatus::AllOff
                } else {
                    Self::from_flags(bit(word, READY_195_A_BIT), bit(word, READY_195_B_BIT))
                }
            }
        }
    }

    /// Label published in the status snapshot
    pub fn label(&self) -> &'static str {
        match self {
            ReadyStatus::AActive => "A ACTIVE",
            ReadyStatus::BActive => "B ACTIVE",
            ReadyStatus::BothActive => "A + B ACTIVE",
            ReadyStatus::AllOff => "ALL OFF",
        }
    }

    /// Whether channel B is driving
    pub fn b_active(&self) -> bool {
        matches!(self, ReadyStatus::BActive | ReadyStatus::BothActive)
    }
}

impl fmt::Display for ReadyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// PIN15 state from a masked RC:S word (true = energized)
pub fn pin_15(word: u16) -> bool {
    bit(word, PIN15_BIT)
}

/// PIN6 state from a masked RC:S word
pub fn pin_6(word: u16) -> bool {
    bit(word, PIN6_BIT)
}
