//! PDO channel mapping
//!
//! The master keeps a local record of what it has mapped on every channel of every node. The
//! record is what lets TxPDO frames be decoded into the object cache, and RxPDO writes be packed,
//! without asking the node.
//!
//! Remapping a channel is a sequence of SDO writes which is not atomic on the bus. The local
//! record marks a channel inactive before the first write and active only after the last one
//! succeeded, so an interrupted configuration always leaves the channel inactive.

use canmotion_common::{
    constants::{object_ids, values},
    messages::FunctionCode,
    pdo::{mapped_bits, PdoMapping, MAX_MAPPED_BITS, MAX_MAPPED_ENTRIES, PDO_CHANNELS},
    traits::AsyncCanSender,
    CanMessage, ObjectSize, ObjectValue,
};
use log::info;
use serde::Deserialize;

use crate::{
    error::{
        ChannelActiveSnafu, ChannelBusySnafu, ChannelInactiveSnafu, DuplicateChannelNameSnafu,
        InvalidMappingSnafu, LocalError, Result, UnknownChannelSnafu,
    },
    master::NodeHandle,
};

/// Direction of a PDO, seen from the node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PdoDirection {
    /// RxPDO: written by the master, consumed by the node
    Rx,
    /// TxPDO: produced by the node, decoded into the master's cache
    Tx,
}

/// Identifies one of the four receive or four transmit PDO channels of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PdoChannel {
    direction: PdoDirection,
    number: u8,
}

impl PdoChannel {
    /// RxPDO 1
    pub const RX1: PdoChannel = PdoChannel::new_unchecked(PdoDirection::Rx, 1);
    /// RxPDO 2
    pub const RX2: PdoChannel = PdoChannel::new_unchecked(PdoDirection::Rx, 2);
    /// RxPDO 3
    pub const RX3: PdoChannel = PdoChannel::new_unchecked(PdoDirection::Rx, 3);
    /// RxPDO 4
    pub const RX4: PdoChannel = PdoChannel::new_unchecked(PdoDirection::Rx, 4);
    /// TxPDO 1
    pub const TX1: PdoChannel = PdoChannel::new_unchecked(PdoDirection::Tx, 1);
    /// TxPDO 2
    pub const TX2: PdoChannel = PdoChannel::new_unchecked(PdoDirection::Tx, 2);
    /// TxPDO 3
    pub const TX3: PdoChannel = PdoChannel::new_unchecked(PdoDirection::Tx, 3);
    /// TxPDO 4
    pub const TX4: PdoChannel = PdoChannel::new_unchecked(PdoDirection::Tx, 4);

    const fn new_unchecked(direction: PdoDirection, number: u8) -> Self {
        Self { direction, number }
    }

    /// Create a channel from a direction and a channel number in 1..=4
    pub const fn new(direction: PdoDirection, number: u8) -> Option<Self> {
        if number >= 1 && number <= PDO_CHANNELS {
            Some(Self { direction, number })
        } else {
            None
        }
    }

    /// The channel direction
    pub const fn direction(&self) -> PdoDirection {
        self.direction
    }

    /// The channel number, 1..=4
    pub const fn number(&self) -> u8 {
        self.number
    }

    /// Index of the communication parameter record
    pub const fn comm_index(&self) -> u16 {
        let base = match self.direction {
            PdoDirection::Rx => object_ids::RPDO_COMM_BASE,
            PdoDirection::Tx => object_ids::TPDO_COMM_BASE,
        };
        base + (self.number - 1) as u16
    }

    /// Index of the mapping parameter record
    pub const fn mapping_index(&self) -> u16 {
        let base = match self.direction {
            PdoDirection::Rx => object_ids::RPDO_MAP_BASE,
            PdoDirection::Tx => object_ids::TPDO_MAP_BASE,
        };
        base + (self.number - 1) as u16
    }

    /// The function code of frames on this channel
    pub const fn function_code(&self) -> FunctionCode {
        match self.direction {
            PdoDirection::Rx => FunctionCode::Rpdo(self.number),
            PdoDirection::Tx => FunctionCode::Tpdo(self.number),
        }
    }

    /// The predefined COB-ID of this channel for `node`
    pub fn cob_id(&self, node: u8) -> u32 {
        self.function_code().cob_id(node).raw()
    }

    fn slot(&self) -> usize {
        let offset = match self.direction {
            PdoDirection::Rx => 0,
            PdoDirection::Tx => PDO_CHANNELS as usize,
        };
        offset + (self.number - 1) as usize
    }

    fn all() -> impl Iterator<Item = PdoChannel> {
        [PdoDirection::Rx, PdoDirection::Tx]
            .into_iter()
            .flat_map(|d| (1..=PDO_CHANNELS).map(move |n| PdoChannel::new_unchecked(d, n)))
    }
}

impl std::fmt::Display for PdoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.direction {
            PdoDirection::Rx => write!(f, "RxPDO{}", self.number),
            PdoDirection::Tx => write!(f, "TxPDO{}", self.number),
        }
    }
}

/// When a node acts on a PDO
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionMode {
    /// Applied (RxPDO) or sampled and sent (TxPDO) on the next SYNC
    Sync,
    /// Applied immediately (RxPDO) or sent on change (TxPDO), subject to the inhibit time
    #[default]
    Async,
}

impl TransmissionMode {
    /// The transmission type value written to the communication parameter record
    pub const fn transmission_type(&self) -> u8 {
        match self {
            TransmissionMode::Sync => values::TRANSMISSION_TYPE_SYNC,
            TransmissionMode::Async => values::TRANSMISSION_TYPE_ASYNC,
        }
    }
}

/// What the master knows about one PDO channel of a node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelState {
    /// The name given to the channel by the application
    pub name: Option<String>,
    /// Transmission mode
    pub mode: TransmissionMode,
    /// Mapped entries, in frame order
    pub mappings: Vec<PdoMapping>,
    /// Inhibit time, in 100us units, if one was written
    pub inhibit_time: Option<u16>,
    /// True once a complete configuration has been written
    pub active: bool,
    /// True while a configuration is being written
    pub configuring: bool,
}

impl ChannelState {
    /// Total number of payload bytes carried by the channel
    pub fn payload_len(&self) -> usize {
        (mapped_bits(&self.mappings) / 8) as usize
    }

    /// True if the channel is active and maps the given object
    pub fn maps(&self, index: u16, sub: u8) -> bool {
        self.active
            && self
                .mappings
                .iter()
                .any(|m| m.index == index && m.sub == sub)
    }

    /// Split a received payload into the mapped objects
    ///
    /// Returns None if the payload is shorter than the mapping requires. Extra bytes are
    /// ignored.
    pub fn unpack(&self, data: &[u8]) -> Option<Vec<(PdoMapping, ObjectValue)>> {
        if data.len() < self.payload_len() {
            return None;
        }
        let mut offset = 0;
        let mut values = Vec::with_capacity(self.mappings.len());
        for mapping in &self.mappings {
            let len = mapping.object_size()?.bytes();
            let value = ObjectValue::from_le_bytes(&data[offset..offset + len]).ok()?;
            values.push((*mapping, value));
            offset += len;
        }
        Some(values)
    }
}

/// The local record of all eight channels of a node
#[derive(Clone, Debug, Default)]
pub struct PdoMap {
    channels: [ChannelState; 2 * PDO_CHANNELS as usize],
}

impl PdoMap {
    /// Get the state of a channel
    pub fn channel(&self, channel: PdoChannel) -> &ChannelState {
        &self.channels[channel.slot()]
    }

    pub(crate) fn channel_mut(&mut self, channel: PdoChannel) -> &mut ChannelState {
        &mut self.channels[channel.slot()]
    }

    /// Find a channel by its application given name
    pub fn find(&self, name: &str) -> Option<(PdoChannel, &ChannelState)> {
        PdoChannel::all()
            .map(|c| (c, self.channel(c)))
            .find(|(_, state)| state.name.as_deref() == Some(name))
    }

    /// True if any active TxPDO maps the given object
    pub fn is_fed_by_tpdo(&self, index: u16, sub: u8) -> bool {
        PdoChannel::all()
            .filter(|c| c.direction() == PdoDirection::Tx)
            .any(|c| self.channel(c).maps(index, sub))
    }

    /// Claim an inactive channel for configuration under `name`
    ///
    /// Fails if the channel is active or already being configured, or if an active or
    /// configuring channel already carries the name. The name is taken from any inactive channel
    /// which still holds it.
    pub(crate) fn begin_configure(
        &mut self,
        node: u8,
        channel: PdoChannel,
        name: &str,
        mode: TransmissionMode,
    ) -> std::result::Result<(), LocalError> {
        let state = self.channel(channel);
        if state.active {
            return ChannelActiveSnafu { node, channel }.fail();
        }
        if state.configuring {
            return ChannelBusySnafu { node, channel }.fail();
        }
        for other in PdoChannel::all().filter(|c| *c != channel) {
            let other_state = self.channel_mut(other);
            if other_state.name.as_deref() != Some(name) {
                continue;
            }
            if other_state.active || other_state.configuring {
                return DuplicateChannelNameSnafu {
                    node,
                    name: name.to_string(),
                    other,
                }
                .fail();
            }
            other_state.name = None;
        }
        *self.channel_mut(channel) = ChannelState {
            name: Some(name.to_string()),
            mode,
            configuring: true,
            ..Default::default()
        };
        Ok(())
    }

    /// Release a channel claimed by [`Self::begin_configure`], activating it with `mappings`
    /// if the configuration was written
    pub(crate) fn end_configure(&mut self, channel: PdoChannel, mappings: Option<&[PdoMapping]>) {
        let state = self.channel_mut(channel);
        state.configuring = false;
        if let Some(mappings) = mappings {
            state.mappings = mappings.to_vec();
            state.active = true;
        }
    }

    /// Mark every channel inactive, keeping names and mappings for reference
    pub(crate) fn deactivate_all(&mut self) {
        for state in self.channels.iter_mut() {
            state.active = false;
        }
    }
}

/// Check that a mapping can be carried by a single PDO
///
/// Returns a description of the first problem found.
pub fn check_mappings(mappings: &[PdoMapping]) -> std::result::Result<(), String> {
    if mappings.len() > MAX_MAPPED_ENTRIES {
        return Err(format!(
            "{} entries exceeds the limit of {}",
            mappings.len(),
            MAX_MAPPED_ENTRIES
        ));
    }
    if let Some(m) = mappings.iter().find(|m| m.object_size().is_none()) {
        return Err(format!(
            "0x{:X}sub{} has unsupported size of {} bits",
            m.index, m.sub, m.size
        ));
    }
    let bits = mapped_bits(mappings);
    if bits > MAX_MAPPED_BITS {
        return Err(format!("{bits} mapped bits exceeds the limit of {MAX_MAPPED_BITS}"));
    }
    Ok(())
}

/// Pack values into a PDO payload according to a mapping
///
/// Values must match the mapped entries one for one, with the same width.
pub fn pack(mappings: &[PdoMapping], values: &[ObjectValue]) -> std::result::Result<Vec<u8>, String> {
    if mappings.len() != values.len() {
        return Err(format!(
            "{} values given for {} mapped entries",
            values.len(),
            mappings.len()
        ));
    }
    let mut payload = Vec::with_capacity(8);
    for (mapping, value) in mappings.iter().zip(values) {
        if mapping.object_size() != Some(value.size()) {
            return Err(format!(
                "value for 0x{:X}sub{} is {} bits, mapping expects {}",
                mapping.index,
                mapping.sub,
                value.size().bits(),
                mapping.size
            ));
        }
        let (bytes, len) = value.to_le_bytes();
        payload.extend_from_slice(&bytes[..len]);
    }
    Ok(payload)
}

impl<S: AsyncCanSender> NodeHandle<S> {
    /// Get the master's record of a channel
    pub fn pdo_channel(&self, channel: PdoChannel) -> ChannelState {
        self.node().pdo_map().channel(channel).clone()
    }

    /// Look up a channel by name
    pub fn find_pdo(&self, name: &str) -> Option<(PdoChannel, ChannelState)> {
        self.node()
            .pdo_map()
            .find(name)
            .map(|(channel, state)| (channel, state.clone()))
    }

    /// Clear the mapping of all eight channels
    ///
    /// Every channel is marked inactive locally before anything is written. Each channel's
    /// mapping count is then written as zero. All channels are attempted even when one fails,
    /// and the first failure is returned.
    ///
    /// The node needs a moment before it accepts new mappings, so callers should wait for the
    /// configured settle delay before calling [`Self::configure_pdo`].
    pub async fn reset_pdo_map(&self) -> Result<()> {
        self.node().pdo_map_mut().deactivate_all();
        let mut first_error = None;
        for channel in PdoChannel::all() {
            if let Err(e) = self
                .write(channel.mapping_index(), 0, ObjectValue::from(0u8))
                .await
            {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Node {}: PDO mappings cleared", self.id());
                Ok(())
            }
        }
    }

    /// Map a PDO channel and give it a name
    ///
    /// The channel must not be active: either it was never configured by this master, or it
    /// was cleared with [`Self::reset_pdo_map`] or [`Self::disable_pdo`]. It must not be being
    /// configured by another task, and no other active channel of the node may carry `name`.
    ///
    /// The node is written in this order: COB-ID with the invalid bit set, mapping count zero,
    /// transmission type, each mapped entry, mapping count, COB-ID valid. Any failure stops the
    /// sequence and leaves the channel inactive.
    pub async fn configure_pdo(
        &self,
        name: &str,
        channel: PdoChannel,
        mode: TransmissionMode,
        mappings: &[PdoMapping],
    ) -> Result<()> {
        let node = self.id().raw();
        if let Err(reason) = check_mappings(mappings) {
            return Err(InvalidMappingSnafu {
                node,
                channel,
                reason,
            }
            .build()
            .into());
        }
        self.node()
            .pdo_map_mut()
            .begin_configure(node, channel, name, mode)?;

        let result = self.write_pdo_config(channel, mode, mappings).await;
        self.node()
            .pdo_map_mut()
            .end_configure(channel, result.is_ok().then_some(mappings));
        result?;
        info!(
            "Node {node}: {channel} '{name}' mapped {} entries ({} bits), {:?}",
            mappings.len(),
            mapped_bits(mappings),
            mode
        );
        Ok(())
    }

    async fn write_pdo_config(
        &self,
        channel: PdoChannel,
        mode: TransmissionMode,
        mappings: &[PdoMapping],
    ) -> Result<()> {
        let cob_id = channel.cob_id(self.id().raw());
        let comm = channel.comm_index();
        let map = channel.mapping_index();
        self.write_u32(
            comm,
            object_ids::PDO_COMM_COB_ID_SUB,
            cob_id | values::PDO_COB_ID_INVALID,
        )
        .await?;
        self.write_u8(map, 0, 0).await?;
        self.write_u8(
            comm,
            object_ids::PDO_COMM_TRANSMISSION_TYPE_SUB,
            mode.transmission_type(),
        )
        .await?;
        for (i, mapping) in mappings.iter().enumerate() {
            self.write_u32(map, i as u8 + 1, mapping.to_object_value())
                .await?;
        }
        self.write_u8(map, 0, mappings.len() as u8).await?;
        self.write_u32(comm, object_ids::PDO_COMM_COB_ID_SUB, cob_id)
            .await?;
        Ok(())
    }

    /// Disable a channel by clearing its mapping count
    ///
    /// The channel is marked inactive before the write, and stays inactive if it fails.
    pub async fn disable_pdo(&self, channel: PdoChannel) -> Result<()> {
        self.node().pdo_map_mut().channel_mut(channel).active = false;
        self.write_u8(channel.mapping_index(), 0, 0).await?;
        info!("Node {}: {channel} disabled", self.id());
        Ok(())
    }

    /// Set the inhibit time of an asynchronous TxPDO, in units of 100us
    ///
    /// Nodes only accept the inhibit time while the PDO is invalid, so an active channel is
    /// briefly invalidated through its COB-ID around the write.
    pub async fn set_inhibit_time(&self, channel: PdoChannel, inhibit_time: u16) -> Result<()> {
        let node = self.id().raw();
        let state = self.pdo_channel(channel);
        if channel.direction() != PdoDirection::Tx || state.mode != TransmissionMode::Async {
            return Err(InvalidMappingSnafu {
                node,
                channel,
                reason: "inhibit time only applies to asynchronous transmit PDOs".to_string(),
            }
            .build()
            .into());
        }

        let comm = channel.comm_index();
        let cob_id = channel.cob_id(node);
        if state.active {
            self.write_u32(
                comm,
                object_ids::PDO_COMM_COB_ID_SUB,
                cob_id | values::PDO_COB_ID_INVALID,
            )
            .await?;
        }
        self.write_u16(comm, object_ids::PDO_COMM_INHIBIT_TIME_SUB, inhibit_time)
            .await?;
        if state.active {
            self.write_u32(comm, object_ids::PDO_COMM_COB_ID_SUB, cob_id)
                .await?;
        }
        self.node().pdo_map_mut().channel_mut(channel).inhibit_time = Some(inhibit_time);
        Ok(())
    }

    /// Send values on a named receive PDO
    ///
    /// The values must match the channel's mapping in count and width. A synchronous channel
    /// takes effect on the node at the next SYNC; an asynchronous one immediately.
    pub async fn write_pdo(&self, name: &str, values: &[ObjectValue]) -> Result<()> {
        let node = self.id().raw();
        let (channel, state) = self.find_pdo(name).ok_or_else(|| {
            UnknownChannelSnafu {
                node,
                name: name.to_string(),
            }
            .build()
        })?;
        if channel.direction() != PdoDirection::Rx {
            return Err(InvalidMappingSnafu {
                node,
                channel,
                reason: "only receive PDOs can be written".to_string(),
            }
            .build()
            .into());
        }
        if !state.active {
            return Err(ChannelInactiveSnafu { node, channel }.build().into());
        }
        let payload = pack(&state.mappings, values).map_err(|reason| {
            InvalidMappingSnafu {
                node,
                channel,
                reason,
            }
            .build()
        })?;
        let msg = CanMessage::new(channel.function_code().cob_id(node), &payload);
        self.send(msg).await
    }

    /// Clear all mappings, wait for the node to settle, then apply the PDO channels listed in
    /// this node's configuration
    pub async fn setup_pdos(&self) -> Result<()> {
        let channels = self.node().config().pdos.clone();
        self.reset_pdo_map().await?;
        tokio::time::sleep(self.timing().pdo_settle).await;
        for pdo in &channels {
            let channel = pdo.pdo_channel()?;
            self.configure_pdo(&pdo.name, channel, pdo.mode, &pdo.mappings)
                .await?;
            if let Some(inhibit_time) = pdo.inhibit_time {
                self.set_inhibit_time(channel, inhibit_time).await?;
            }
        }
        Ok(())
    }
}

/// Build a mapping entry for an object of `size`
pub fn mapping(index: u16, sub: u8, size: ObjectSize) -> PdoMapping {
    PdoMapping::new(index, sub, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_indices() {
        assert_eq!(0x1400, PdoChannel::RX1.comm_index());
        assert_eq!(0x1603, PdoChannel::RX4.mapping_index());
        assert_eq!(0x1801, PdoChannel::TX2.comm_index());
        assert_eq!(0x1A00, PdoChannel::TX1.mapping_index());
        assert_eq!(0x201, PdoChannel::RX1.cob_id(1));
        assert_eq!(0x385, PdoChannel::TX3.cob_id(5));
        assert_eq!(None, PdoChannel::new(PdoDirection::Rx, 0));
        assert_eq!(None, PdoChannel::new(PdoDirection::Tx, 5));
        assert_eq!("TxPDO2", PdoChannel::TX2.to_string());
    }

    #[test]
    fn test_check_mappings() {
        let ok = [
            mapping(0x6040, 0, ObjectSize::Bits16),
            mapping(0x607A, 0, ObjectSize::Bits32),
        ];
        assert_eq!(Ok(()), check_mappings(&ok));

        let too_wide = [mapping(0x607A, 0, ObjectSize::Bits32); 3];
        assert!(check_mappings(&too_wide).is_err());

        let bad_size = [PdoMapping {
            index: 0x6040,
            sub: 0,
            size: 12,
        }];
        assert!(check_mappings(&bad_size).is_err());

        let too_many = [mapping(0x2000, 1, ObjectSize::Bits8); 9];
        assert!(check_mappings(&too_many).is_err());
    }

    #[test]
    fn test_pack_and_unpack() {
        let mappings = vec![
            mapping(0x6041, 0, ObjectSize::Bits16),
            mapping(0x6064, 0, ObjectSize::Bits32),
        ];
        let payload = pack(
            &mappings,
            &[ObjectValue::from(0x1637u16), ObjectValue::from(-2i32)],
        )
        .unwrap();
        assert_eq!(vec![0x37, 0x16, 0xFE, 0xFF, 0xFF, 0xFF], payload);

        let state = ChannelState {
            mappings: mappings.clone(),
            active: true,
            ..Default::default()
        };
        let values = state.unpack(&payload).unwrap();
        assert_eq!(0x1637, values[0].1.as_u32());
        assert_eq!(-2, values[1].1.as_i32());
        assert_eq!(None, state.unpack(&payload[..5]));

        // Width mismatch is refused
        assert!(pack(&mappings, &[ObjectValue::from(1u8), ObjectValue::from(2i32)]).is_err());
        assert!(pack(&mappings, &[ObjectValue::from(1u16)]).is_err());
    }

    #[test]
    fn test_map_lookup() {
        let mut map = PdoMap::default();
        *map.channel_mut(PdoChannel::TX1) = ChannelState {
            name: Some("status".into()),
            mode: TransmissionMode::Async,
            mappings: vec![mapping(0x6041, 0, ObjectSize::Bits16)],
            inhibit_time: None,
            active: true,
            configuring: false,
        };
        let (channel, _) = map.find("status").unwrap();
        assert_eq!(PdoChannel::TX1, channel);
        assert!(map.is_fed_by_tpdo(0x6041, 0));
        assert!(!map.is_fed_by_tpdo(0x6064, 0));

        map.deactivate_all();
        assert!(!map.is_fed_by_tpdo(0x6041, 0));
        assert!(map.find("status").is_some());
    }

    #[test]
    fn test_configure_claims_channel() {
        let mut map = PdoMap::default();
        map.begin_configure(3, PdoChannel::RX1, "cw", TransmissionMode::Sync)
            .unwrap();
        assert!(map.channel(PdoChannel::RX1).configuring);

        // A second configuration of the same channel is refused while the first is running
        assert_eq!(
            Err(LocalError::ChannelBusy {
                node: 3,
                channel: PdoChannel::RX1
            }),
            map.begin_configure(3, PdoChannel::RX1, "cw", TransmissionMode::Sync)
        );
        // And so is the same name on another channel
        assert!(matches!(
            map.begin_configure(3, PdoChannel::RX2, "cw", TransmissionMode::Async),
            Err(LocalError::DuplicateChannelName { other: PdoChannel::RX1, .. })
        ));

        let mappings = [mapping(0x6040, 0, ObjectSize::Bits16)];
        map.end_configure(PdoChannel::RX1, Some(&mappings));
        let state = map.channel(PdoChannel::RX1);
        assert!(state.active && !state.configuring);
        assert_eq!(mappings.to_vec(), state.mappings);

        // A failed configuration releases the channel without activating it
        map.begin_configure(3, PdoChannel::TX1, "status", TransmissionMode::Async)
            .unwrap();
        map.end_configure(PdoChannel::TX1, None);
        let state = map.channel(PdoChannel::TX1);
        assert!(!state.active && !state.configuring);

        // The name of an inactive channel moves to the newly configured one
        map.begin_configure(3, PdoChannel::TX2, "status", TransmissionMode::Async)
            .unwrap();
        assert_eq!(None, map.channel(PdoChannel::TX1).name);
        assert_eq!(PdoChannel::TX2, map.find("status").unwrap().0);
    }
}
