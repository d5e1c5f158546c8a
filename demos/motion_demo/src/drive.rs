//! CiA 402 helpers for a positioning drive
//!
//! Only the parts of the device profile the demo needs: the power state machine commands, the
//! profile velocity and profile position modes, and the "target reached" status bit.

use std::time::Duration;

use canmotion_master::{common::traits::AsyncCanSender, MasterError, NodeHandle};
use log::{debug, info};
use snafu::Snafu;

pub const CONTROLWORD: u16 = 0x6040;
pub const STATUSWORD: u16 = 0x6041;
pub const MODES_OF_OPERATION: u16 = 0x6060;
pub const POSITION_ACTUAL: u16 = 0x6064;
pub const VELOCITY_ACTUAL: u16 = 0x606C;
pub const TARGET_POSITION: u16 = 0x607A;
pub const PROFILE_VELOCITY: u16 = 0x6081;
pub const PROFILE_ACCELERATION: u16 = 0x6083;
pub const PROFILE_DECELERATION: u16 = 0x6084;
pub const TARGET_VELOCITY: u16 = 0x60FF;

/// Controlword bits
pub mod cw {
    pub const SWITCH_ON: u16 = 1 << 0;
    pub const ENABLE_VOLTAGE: u16 = 1 << 1;
    pub const QUICK_STOP: u16 = 1 << 2;
    pub const ENABLE_OPERATION: u16 = 1 << 3;
    /// Profile position: latch the target position on a rising edge
    pub const NEW_SET_POINT: u16 = 1 << 4;
    pub const CHANGE_SET_IMMEDIATELY: u16 = 1 << 5;
    /// Profile position: set for a relative move
    pub const RELATIVE: u16 = 1 << 6;
    pub const FAULT_RESET: u16 = 1 << 7;
    pub const HALT: u16 = 1 << 8;

    /// Shutdown: enter "ready to switch on"
    pub const SHUTDOWN: u16 = QUICK_STOP | ENABLE_VOLTAGE;
    /// Switch on and enable operation in one step
    pub const ENABLE: u16 = SHUTDOWN | SWITCH_ON | ENABLE_OPERATION;
}

/// Statusword bits
pub mod sw {
    pub const TARGET_REACHED: u16 = 1 << 10;
}

/// Set or clear each of `bits` in a controlword
pub fn set_bits(controlword: u16, bits: &[(u16, bool)]) -> u16 {
    bits.iter().fold(controlword, |word, (bit, set)| {
        if *set {
            word | bit
        } else {
            word & !bit
        }
    })
}

pub fn target_reached(statusword: u16) -> bool {
    statusword & sw::TARGET_REACHED != 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum OperationMode {
    ProfilePosition = 1,
    ProfileVelocity = 3,
}

#[derive(Debug, Snafu)]
pub enum MotionError {
    #[snafu(context(false), display("{source}"))]
    Master { source: MasterError },
    #[snafu(display("Node {node} did not reach its target within {timeout:?}"))]
    TargetTimeout { node: u8, timeout: Duration },
}

/// A CiA 402 drive on the bus
pub struct Drive<S> {
    node: NodeHandle<S>,
}

impl<S: AsyncCanSender> Drive<S> {
    pub fn new(node: NodeHandle<S>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &NodeHandle<S> {
        &self.node
    }

    async fn controlword(&self) -> u16 {
        // The drive may not have been read yet, in which case a plain "enabled" word is assumed
        let entry = self.node.read_entry(CONTROLWORD, 0).await;
        if entry.valid {
            entry.value.as_u16()
        } else {
            cw::ENABLE
        }
    }

    pub async fn write_controlword(&self, word: u16) -> Result<(), MotionError> {
        debug!("Node {} controlword 0x{word:04X}", self.node.id());
        Ok(self.node.write_u16(CONTROLWORD, 0, word).await?)
    }

    /// Remove torque, leaving the drive in "ready to switch on"
    pub async fn disable(&self) -> Result<(), MotionError> {
        self.write_controlword(cw::SHUTDOWN).await
    }

    /// Acknowledge a fault. Takes effect on the rising edge of the fault reset bit.
    pub async fn clear_error(&self) -> Result<(), MotionError> {
        self.write_controlword(0).await?;
        self.write_controlword(cw::FAULT_RESET).await
    }

    /// Apply torque and hold position
    pub async fn enable(&self) -> Result<(), MotionError> {
        self.write_controlword(cw::SHUTDOWN).await?;
        self.write_controlword(cw::ENABLE).await
    }

    /// Stop motion using the profile deceleration, staying enabled
    pub async fn halt(&self) -> Result<(), MotionError> {
        let word = set_bits(self.controlword().await, &[(cw::HALT, true)]);
        self.write_controlword(word).await
    }

    pub async fn set_mode(&self, mode: OperationMode) -> Result<(), MotionError> {
        info!("Node {}: mode {mode:?}", self.node.id());
        Ok(self
            .node
            .write_i8(MODES_OF_OPERATION, 0, mode as i8)
            .await?)
    }

    /// Profile velocity mode: run at `velocity` until halted
    pub async fn move_at_velocity(&self, velocity: i32) -> Result<(), MotionError> {
        self.node.write_i32(TARGET_VELOCITY, 0, velocity).await?;
        self.write_controlword(cw::ENABLE).await
    }

    /// Profile position mode: move to `target` and wait until the drive reports it reached
    pub async fn move_to_position(
        &self,
        target: i32,
        absolute: bool,
        immediately: bool,
        timeout: Duration,
    ) -> Result<(), MotionError> {
        self.node.write_i32(TARGET_POSITION, 0, target).await?;
        let word = set_bits(
            cw::ENABLE,
            &[
                (cw::NEW_SET_POINT, true),
                (cw::RELATIVE, !absolute),
                (cw::CHANGE_SET_IMMEDIATELY, immediately),
            ],
        );
        self.write_controlword(word).await?;
        self.write_controlword(set_bits(word, &[(cw::NEW_SET_POINT, false)]))
            .await?;
        self.wait_for_target(timeout).await
    }

    /// Poll the statusword until "target reached" is set, logging progress
    ///
    /// When a TxPDO carries the statusword and position, polling causes no SDO traffic for them.
    pub async fn wait_for_target(&self, timeout: Duration) -> Result<(), MotionError> {
        let poll = async {
            loop {
                let status = self.node.read_u16(STATUSWORD, 0).await?;
                if target_reached(status) {
                    return Ok::<(), MasterError>(());
                }
                let velocity = self.node.read_i32(VELOCITY_ACTUAL, 0).await?;
                let position = self.node.read_i32(POSITION_ACTUAL, 0).await?;
                info!(
                    "Node {}: velocity {velocity}, position {position}",
                    self.node.id()
                );
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => Ok(result?),
            Err(_) => TargetTimeoutSnafu {
                node: self.node.id().raw(),
                timeout,
            }
            .fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_bits() {
        let word = set_bits(
            cw::ENABLE,
            &[
                (cw::NEW_SET_POINT, true),
                (cw::RELATIVE, true),
                (cw::HALT, false),
            ],
        );
        assert_eq!(0x005F, word);
        assert_eq!(0x000F, set_bits(word, &[(cw::NEW_SET_POINT, false), (cw::RELATIVE, false)]));
        assert_eq!(0x010F, set_bits(cw::ENABLE, &[(cw::HALT, true)]));
    }

    #[test]
    fn test_power_commands() {
        assert_eq!(0x0006, cw::SHUTDOWN);
        assert_eq!(0x000F, cw::ENABLE);
        assert_eq!(0x0080, cw::FAULT_RESET);
    }

    #[test]
    fn test_target_reached() {
        assert!(target_reached(0x0637));
        assert!(!target_reached(0x0237));
    }
}
