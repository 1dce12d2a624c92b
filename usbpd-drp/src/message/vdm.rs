//! Structured vendor-defined messages: headers, identity objects, and the
//! mode VDOs consumed by the alternate-mode modules.
use heapless::Vec;
use proc_bitfield::bitfield;

/// The PD standard ID, used for identity and cable discovery.
pub const PD_SID: u16 = 0xFF00;
/// The DisplayPort alternate-mode SVID.
pub const DP_SID: u16 = 0xFF01;
/// The Intel SVID, used by Thunderbolt-compat mode.
pub const INTEL_VID: u16 = 0x8087;

/// Structured VDM command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmCommand {
    /// Discover Identity.
    DiscoverIdentity,
    /// Discover SVIDs.
    DiscoverSvids,
    /// Discover Modes.
    DiscoverModes,
    /// Enter Mode.
    EnterMode,
    /// Exit Mode.
    ExitMode,
    /// Attention.
    Attention,
    /// DisplayPort Status Update.
    DisplayPortStatus,
    /// DisplayPort Configure.
    DisplayPortConfig,
}

impl VdmCommand {
    /// Parse a command code; `None` for reserved values.
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::DiscoverIdentity),
            0x02 => Some(Self::DiscoverSvids),
            0x03 => Some(Self::DiscoverModes),
            0x04 => Some(Self::EnterMode),
            0x05 => Some(Self::ExitMode),
            0x06 => Some(Self::Attention),
            0x10 => Some(Self::DisplayPortStatus),
            0x11 => Some(Self::DisplayPortConfig),
            _ => None,
        }
    }
}

impl From<VdmCommand> for u8 {
    fn from(value: VdmCommand) -> Self {
        match value {
            VdmCommand::DiscoverIdentity => 0x01,
            VdmCommand::DiscoverSvids => 0x02,
            VdmCommand::DiscoverModes => 0x03,
            VdmCommand::EnterMode => 0x04,
            VdmCommand::ExitMode => 0x05,
            VdmCommand::Attention => 0x06,
            VdmCommand::DisplayPortStatus => 0x10,
            VdmCommand::DisplayPortConfig => 0x11,
        }
    }
}

/// Structured VDM command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmCommandType {
    /// Initiator request.
    InitiatorReq,
    /// Responder acknowledge.
    ResponderAck,
    /// Responder negative acknowledge.
    ResponderNak,
    /// Responder busy.
    ResponderBusy,
}

impl From<u8> for VdmCommandType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0 => VdmCommandType::InitiatorReq,
            1 => VdmCommandType::ResponderAck,
            2 => VdmCommandType::ResponderNak,
            _ => VdmCommandType::ResponderBusy,
        }
    }
}

impl From<VdmCommandType> for u8 {
    fn from(value: VdmCommandType) -> Self {
        match value {
            VdmCommandType::InitiatorReq => 0,
            VdmCommandType::ResponderAck => 1,
            VdmCommandType::ResponderNak => 2,
            VdmCommandType::ResponderBusy => 3,
        }
    }
}

/// Structured VDM versions, as carried in the header's version field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SvdmVersion {
    /// Version 1.0 (PD r2.0).
    V10,
    /// Version 2.0 (PD r3.x).
    V20,
}

bitfield! {
    /// The first VDO of every structured VDM.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VdmHeader(pub u32): Debug, FromStorage, IntoStorage {
        /// VDM standard or vendor ID.
        pub standard_or_vid: u16 @ 16..=31,
        /// Set for structured VDMs.
        pub vdm_type: bool @ 15,
        /// Structured VDM version, major.
        pub vdm_version_major: u8 @ 13..=14,
        /// Structured VDM version, minor.
        pub vdm_version_minor: u8 @ 11..=12,
        /// Object position, for Enter/Exit Mode.
        pub object_position: u8 @ 8..=10,
        /// Command type.
        pub command_type: u8 [get VdmCommandType, set VdmCommandType] @ 6..=7,
        /// Raw command code.
        pub command_raw: u8 @ 0..=4,
    }
}

impl VdmHeader {
    /// Build a structured request header.
    pub fn new_request(svid: u16, version: SvdmVersion, command: VdmCommand) -> Self {
        VdmHeader(0)
            .with_standard_or_vid(svid)
            .with_vdm_type(true)
            .with_vdm_version_major(match version {
                SvdmVersion::V10 => 0b00,
                SvdmVersion::V20 => 0b01,
            })
            .with_command_type(VdmCommandType::InitiatorReq)
            .with_command_raw(command.into())
    }

    /// The typed command, `None` for reserved codes.
    pub fn command(&self) -> Option<VdmCommand> {
        VdmCommand::from_raw(self.command_raw())
    }

    /// The structured VDM version.
    pub fn version(&self) -> SvdmVersion {
        if self.vdm_version_major() == 0 {
            SvdmVersion::V10
        } else {
            SvdmVersion::V20
        }
    }

    /// Reply header acknowledging this request.
    pub fn ack(self) -> Self {
        self.with_command_type(VdmCommandType::ResponderAck)
    }

    /// Reply header rejecting this request.
    pub fn nak(self) -> Self {
        self.with_command_type(VdmCommandType::ResponderNak)
    }
}

/// Product types a UFP partner can report in its ID header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProductTypeUfp {
    /// Not a UFP product.
    NotUfp,
    /// PD-capable USB hub.
    Hub,
    /// PD-capable USB peripheral.
    Peripheral,
    /// Power-only device.
    Psd,
    /// Deprecated alternate-mode adapter.
    Ama,
    /// Vconn-powered device.
    Vpd,
    /// Reserved code.
    Reserved,
}

impl From<u8> for ProductTypeUfp {
    fn from(value: u8) -> Self {
        match value {
            0b000 => ProductTypeUfp::NotUfp,
            0b001 => ProductTypeUfp::Hub,
            0b010 => ProductTypeUfp::Peripheral,
            0b011 => ProductTypeUfp::Psd,
            0b101 => ProductTypeUfp::Ama,
            0b110 => ProductTypeUfp::Vpd,
            _ => ProductTypeUfp::Reserved,
        }
    }
}

/// Cable plug product types, reported on SOP'.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProductTypeCable {
    /// No cable plug.
    None,
    /// Passive cable.
    Passive,
    /// Active cable.
    Active,
    /// Vconn-powered device.
    Vpd,
    /// Reserved code.
    Reserved,
}

impl From<u8> for ProductTypeCable {
    fn from(value: u8) -> Self {
        match value {
            0b000 => ProductTypeCable::None,
            0b011 => ProductTypeCable::Passive,
            0b100 => ProductTypeCable::Active,
            0b110 => ProductTypeCable::Vpd,
            _ => ProductTypeCable::Reserved,
        }
    }
}

bitfield! {
    /// Identity header VDO (first response object of Discover Identity).
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct IdHeader(pub u32): Debug, FromStorage, IntoStorage {
        /// Host data capable.
        pub host_data: bool @ 31,
        /// Device data capable.
        pub device_data: bool @ 30,
        /// Product type (UFP on SOP, cable plug on SOP').
        pub product_type: u8 @ 27..=29,
        /// Modal operation supported.
        pub modal_supported: bool @ 26,
        /// Product type DFP.
        pub product_type_dfp: u8 @ 23..=25,
        /// Connector type.
        pub connector_type: u8 @ 21..=22,
        /// Vendor ID.
        pub vid: u16 @ 0..=15,
    }
}

impl IdHeader {
    /// The UFP product type (only meaningful on SOP).
    pub fn product_type_ufp(&self) -> ProductTypeUfp {
        self.product_type().into()
    }

    /// The cable plug product type (only meaningful on SOP').
    pub fn product_type_cable(&self) -> ProductTypeCable {
        self.product_type().into()
    }
}

bitfield! {
    /// Cert Stat VDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct CertStat(pub u32): Debug, FromStorage, IntoStorage {
        /// USB-IF assigned XID.
        pub xid: u32 @ 0..=31,
    }
}

bitfield! {
    /// Product VDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Product(pub u32): Debug, FromStorage, IntoStorage {
        /// USB product ID.
        pub pid: u16 @ 16..=31,
        /// Device release number.
        pub bcd_device: u16 @ 0..=15,
    }
}

/// USB signaling speeds, shared by cable and UFP VDOs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbSpeed {
    /// USB 2.0 only.
    Usb20,
    /// USB 3.2 Gen1.
    Usb32Gen1,
    /// USB 3.2 / USB4 Gen2.
    Usb32Gen2,
    /// USB4 Gen3.
    Usb40Gen3,
    /// USB4 Gen4.
    Usb40Gen4,
}

impl UsbSpeed {
    /// Parse the 3-bit speed field; `None` for reserved codes.
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0b000 => Some(UsbSpeed::Usb20),
            0b001 => Some(UsbSpeed::Usb32Gen1),
            0b010 => Some(UsbSpeed::Usb32Gen2),
            0b011 => Some(UsbSpeed::Usb40Gen3),
            0b100 => Some(UsbSpeed::Usb40Gen4),
            _ => None,
        }
    }
}

bitfield! {
    /// UFP VDO (product-type VDO 1 of a Hub or Peripheral).
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct UfpVdo(pub u32): Debug, FromStorage, IntoStorage {
        /// UFP VDO version.
        pub version: u8 @ 29..=31,
        /// Device capabilities (USB2 / USB2 billboard / USB3.2 / USB4).
        pub device_capability: u8 @ 24..=27,
        /// VCONN power rating.
        pub vconn_power: u8 @ 8..=10,
        /// VCONN required.
        pub vconn_required: bool @ 7,
        /// vBus required.
        pub vbus_required: bool @ 6,
        /// Alternate modes supported (bitmask).
        pub alternate_modes: u8 @ 3..=5,
        /// Highest supported USB speed.
        pub usb_highest_speed: u8 @ 0..=2,
    }
}

impl UfpVdo {
    /// USB4 device capability bit in the device-capability field.
    pub fn usb4_device_capable(&self) -> bool {
        self.device_capability() & 0b1000 != 0
    }

    /// Whether the device reports any alternate-mode support.
    pub fn supports_alternate_modes(&self) -> bool {
        self.alternate_modes() != 0
    }
}

bitfield! {
    /// Passive cable VDO (product-type VDO 1 on SOP').
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct PassiveCableVdo(pub u32): Debug, FromStorage, IntoStorage {
        /// Firmware version.
        pub firmware_version: u8 @ 28..=31,
        /// VDO version.
        pub vdo_version: u8 @ 21..=23,
        /// vBus current handling capability.
        pub vbus_current: u8 @ 5..=6,
        /// Maximum USB signaling speed.
        pub usb_highest_speed: u8 @ 0..=2,
    }
}

impl PassiveCableVdo {
    /// The maximum speed the cable carries.
    pub fn speed(&self) -> Option<UsbSpeed> {
        UsbSpeed::from_raw(self.usb_highest_speed())
    }
}

bitfield! {
    /// Active cable VDO 1 (product-type VDO 1 on SOP').
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ActiveCableVdo1(pub u32): Debug, FromStorage, IntoStorage {
        /// Firmware version.
        pub firmware_version: u8 @ 28..=31,
        /// VDO version (1.3 is encoded as 0b011).
        pub vdo_version: u8 @ 21..=23,
        /// SOP'' controller present.
        pub sop_pp_controller: bool @ 3,
        /// vBus current handling capability.
        pub vbus_current: u8 @ 5..=6,
        /// Maximum USB signaling speed.
        pub usb_highest_speed: u8 @ 0..=2,
    }
}

/// Active cable VDO version encoding 1.3, the first with a USB4 bit.
pub const ACTIVE_CABLE_VDO_VERSION_1_3: u8 = 0b011;

impl ActiveCableVdo1 {
    /// The maximum speed the cable carries.
    pub fn speed(&self) -> Option<UsbSpeed> {
        UsbSpeed::from_raw(self.usb_highest_speed())
    }
}

bitfield! {
    /// Active cable VDO 2 (product-type VDO 2 on SOP').
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ActiveCableVdo2(pub u32): Debug, FromStorage, IntoStorage {
        /// Maximum operating temperature.
        pub max_operating_temp: u8 @ 24..=31,
        /// Set when the cable supports USB4.
        pub usb_40_support: bool @ 8,
        /// USB 2.0 supported.
        pub usb_20_support: bool @ 5,
        /// USB 3.2 supported.
        pub usb_32_support: bool @ 4,
        /// Cable is optically isolated.
        pub optically_isolated: bool @ 3,
        /// Number of lanes supported.
        pub usb_lanes: bool @ 2,
        /// Physical connection (copper/optical).
        pub physical_connection: bool @ 1,
        /// Speed lossiness indicator.
        pub speed_supported: bool @ 0,
    }
}

/// Thunderbolt cable speed codes in the TBT3 cable discover-mode VDO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TbtCableSpeed {
    /// USB 3.1 Gen1.
    Usb31Gen1,
    /// USB 3.1 Gen1 and Gen2.
    Usb31Gen2,
    /// Thunderbolt Gen3.
    TbtGen3,
    /// Reserved code.
    Reserved,
}

impl From<u8> for TbtCableSpeed {
    fn from(value: u8) -> Self {
        match value {
            0b001 => TbtCableSpeed::Usb31Gen1,
            0b010 => TbtCableSpeed::Usb31Gen2,
            0b011 => TbtCableSpeed::TbtGen3,
            _ => TbtCableSpeed::Reserved,
        }
    }
}

/// Rounded-speed support codes in the TBT3 cable discover-mode VDO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TbtRounded {
    /// Gen3 non-rounded only.
    NonRounded,
    /// Gen3 and Gen4 rounded and non-rounded.
    Gen3Gen4Rounded,
    /// Reserved code.
    Reserved,
}

impl From<u8> for TbtRounded {
    fn from(value: u8) -> Self {
        match value {
            0b00 => TbtRounded::NonRounded,
            0b01 => TbtRounded::Gen3Gen4Rounded,
            _ => TbtRounded::Reserved,
        }
    }
}

bitfield! {
    /// TBT3 discover-mode response VDO (Intel SVID), from partner or cable.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct TbtModeVdo(pub u32): Debug, FromStorage, IntoStorage {
        /// Cable is active (1) rather than passive (0).
        pub cable_active: bool @ 25,
        /// Retimed (1) or redriven (0).
        pub retimer: bool @ 22,
        /// Optical cable.
        pub optical: bool @ 21,
        /// Rounded-speed support.
        pub rounded: u8 [get TbtRounded] @ 19..=20,
        /// Cable speed.
        pub cable_speed: u8 [get TbtCableSpeed] @ 16..=18,
        /// Intel-specific mode bits; bit 0 set means TBT mode.
        pub intel_mode: u16 @ 0..=15,
    }
}

impl TbtModeVdo {
    /// Whether the VDO advertises Thunderbolt mode at all.
    pub fn tbt_mode(&self) -> bool {
        self.intel_mode() & 0x0001 != 0
    }
}

bitfield! {
    /// DisplayPort capabilities discover-mode VDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct DisplayPortModeVdo(pub u32): Debug, FromStorage, IntoStorage {
        /// UFP_D pin assignments supported.
        pub ufp_d_pin_assignments: u8 @ 16..=23,
        /// DFP_D pin assignments supported.
        pub dfp_d_pin_assignments: u8 @ 8..=15,
        /// USB r2.0 signaling not used.
        pub usb20_signalling_not_used: bool @ 7,
        /// Receptacle (1) or plug (0) indication.
        pub receptacle_indication: bool @ 6,
        /// Signaling rates supported for DisplayPort transport.
        pub signaling_rate: u8 @ 2..=5,
        /// Port capability (DP source / sink / both).
        pub capability: u8 @ 0..=1,
    }
}

impl DisplayPortModeVdo {
    /// Whether the partner can act as a DisplayPort sink (UFP_D).
    pub fn ufp_d_capable(&self) -> bool {
        self.capability() & 0b01 != 0
    }
}

bitfield! {
    /// DisplayPort Status Update VDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct DisplayPortStatusVdo(pub u32): Debug, FromStorage, IntoStorage {
        /// IRQ_HPD pulse seen.
        pub irq_hpd: bool @ 8,
        /// HPD level.
        pub hpd_level: bool @ 7,
        /// Exit-DP-mode request.
        pub exit_dp_mode_request: bool @ 6,
        /// USB configuration request.
        pub usb_config_request: bool @ 5,
        /// Multi-function preferred.
        pub multi_function_preferred: bool @ 4,
        /// Adapter enabled.
        pub enabled: bool @ 3,
        /// Power low indicator.
        pub power_low: bool @ 2,
        /// DFP_D/UFP_D connection status.
        pub connected: u8 @ 0..=1,
    }
}

bitfield! {
    /// DisplayPort Configure VDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct DisplayPortConfigVdo(pub u32): Debug, FromStorage, IntoStorage {
        /// Selected pin assignment (one-hot).
        pub pin_assignment: u8 @ 8..=15,
        /// Signaling rate selection.
        pub signaling: u8 @ 2..=5,
        /// Select configuration: 0 = USB, 1 = UFP_U as DFP_D, 2 = UFP_U as UFP_D.
        pub configuration: u8 @ 0..=1,
    }
}

/// A Discover SVIDs response: SVIDs are packed two per VDO, high half
/// first, zero-terminated.
pub fn parse_svids(objects: &[u32]) -> Vec<u16, 12> {
    let mut svids = Vec::new();

    'outer: for vdo in objects {
        for svid in [(vdo >> 16) as u16, (vdo & 0xFFFF) as u16] {
            if svid == 0 {
                break 'outer;
            }
            if svids.push(svid).is_err() {
                break 'outer;
            }
        }
    }

    svids
}

#[cfg(test)]
mod tests {
    use super::{
        DP_SID, IdHeader, ProductTypeCable, ProductTypeUfp, SvdmVersion, TbtCableSpeed, TbtModeVdo, VdmCommand,
        VdmCommandType, VdmHeader, parse_svids,
    };

    #[test]
    fn request_header_round_trip() {
        let header = VdmHeader::new_request(DP_SID, SvdmVersion::V20, VdmCommand::EnterMode).with_object_position(1);

        assert_eq!(header.standard_or_vid(), DP_SID);
        assert!(header.vdm_type());
        assert_eq!(header.command(), Some(VdmCommand::EnterMode));
        assert_eq!(header.command_type(), VdmCommandType::InitiatorReq);
        assert_eq!(header.version(), SvdmVersion::V20);

        let ack = header.ack();
        assert_eq!(ack.command_type(), VdmCommandType::ResponderAck);
        assert_eq!(ack.command(), Some(VdmCommand::EnterMode));
    }

    #[test]
    fn id_header_product_types() {
        let partner = IdHeader(0).with_product_type(0b001).with_modal_supported(true);
        assert_eq!(partner.product_type_ufp(), ProductTypeUfp::Hub);

        let cable = IdHeader(0).with_product_type(0b100);
        assert_eq!(cable.product_type_cable(), ProductTypeCable::Active);
    }

    #[test]
    fn svids_zero_terminated() {
        let objects = [(0xFF01u32 << 16) | 0x8087, 0];
        let svids = parse_svids(&objects);

        assert_eq!(svids.as_slice(), &[0xFF01, 0x8087]);
    }

    #[test]
    fn tbt_vdo_fields() {
        let vdo = TbtModeVdo(0).with_intel_mode(0x0001).with_cable_speed(0b011);
        assert!(vdo.tbt_mode());
        assert_eq!(vdo.cable_speed(), TbtCableSpeed::TbtGen3);
    }
}
