//! USB4 mode entry.
//!
//! USB4 itself is entered with Enter_USB data messages, walked across
//! the cable plugs and then the partner. Older active cables cannot be
//! told about USB4 directly and enter Thunderbolt-compat mode on their
//! plugs first; the decision tree below picks the path.
use heapless::Vec;
use usbpd_drp_traits::{Board, Chipset, MuxMode, ProtocolLayer, Sop};

use crate::engine::Ctx;
use crate::message::enter_usb::{CableType, EnterUsbDo};
use crate::message::vdm::{
    ACTIVE_CABLE_VDO_VERSION_1_3, ActiveCableVdo1, ActiveCableVdo2, IdHeader, PassiveCableVdo, ProductTypeCable,
    ProductTypeUfp, SvdmVersion, TbtCableSpeed, TbtRounded, UfpVdo, UsbSpeed,
};
use crate::pe::PolicyEngine;
use crate::port::PeFlag;

use super::tbt::ThunderboltMode;

/// USB4 entry progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Usb4State {
    Start,
    EnterRequested,
    Active,
    Inactive,
}

/// The USB4 entry driver for one port.
#[derive(Debug)]
pub struct Usb4Mode {
    state: Usb4State,
}

impl Usb4Mode {
    /// Create the driver.
    pub fn new() -> Self {
        Self { state: Usb4State::Start }
    }

    /// Reset on detach or Data Reset.
    pub fn reset(&mut self) {
        self.state = Usb4State::Start;
    }

    /// Whether entry concluded (either way).
    pub fn entry_is_done(&self) -> bool {
        matches!(self.state, Usb4State::Active | Usb4State::Inactive)
    }

    /// Whether USB4 is up.
    pub fn is_active(&self) -> bool {
        self.state == Usb4State::Active
    }

    /// Tear down: USB4 has no exit message; Data Reset is the real exit.
    pub fn exit_mode_request<P: ProtocolLayer, B: Board, C: Chipset>(&mut self, ctx: &mut Ctx<P, B, C>) {
        if self.is_active() {
            ctx.board.mux_set(ctx.port.id, MuxMode::Safe, false);
        }
        self.reset();
    }

    /// Whether the port partner can enter USB4.
    pub fn partner_is_capable<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &Ctx<P, B, C>) -> bool {
        let discovery = &ctx.port.discovery[Sop::Sop.index()];
        let Some(id_header) = discovery.identity.first().map(|raw| IdHeader(*raw)) else {
            return false;
        };

        // Only hubs and peripherals with a USB4-capable UFP VDO qualify;
        // the deprecated AMA product type never does.
        if !matches!(
            id_header.product_type_ufp(),
            ProductTypeUfp::Hub | ProductTypeUfp::Peripheral
        ) {
            return false;
        }

        discovery
            .identity
            .get(3)
            .map(|raw| UfpVdo(*raw).usb4_device_capable())
            .unwrap_or(false)
    }

    /// The cable-side capability decision.
    ///
    /// Passive cables need Gen1 or better. Active cables with a VDM 2.0
    /// conversation and a VDO 1.3 layout carry an authoritative USB4
    /// bit; older active cables are judged by their TBT-mode response.
    pub fn cable_is_capable<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &Ctx<P, B, C>) -> bool {
        let discovery = &ctx.port.discovery[Sop::SopPrime.index()];
        let Some(id_header) = discovery.identity.first().map(|raw| IdHeader(*raw)) else {
            return false;
        };

        match id_header.product_type_cable() {
            ProductTypeCable::Passive => discovery
                .identity
                .get(3)
                .and_then(|raw| PassiveCableVdo(*raw).speed())
                .map(|speed| speed >= UsbSpeed::Usb32Gen1)
                .unwrap_or(false),
            ProductTypeCable::Active => {
                let vdo1 = discovery.identity.get(3).map(|raw| ActiveCableVdo1(*raw));
                let vdm_20 = Self::cable_svdm_version(ctx) >= SvdmVersion::V20;
                let vdo_13 = vdo1
                    .map(|vdo| vdo.vdo_version() >= ACTIVE_CABLE_VDO_VERSION_1_3)
                    .unwrap_or(false);

                if vdm_20 && vdo_13 {
                    return discovery
                        .identity
                        .get(4)
                        .map(|raw| ActiveCableVdo2(*raw).usb_40_support())
                        .unwrap_or(false);
                }

                // Fall back to the Intel-SVID evidence: modal support,
                // a TBT-mode response, and the rounded Gen3/Gen4 bit.
                if !id_header.modal_supported() {
                    return false;
                }
                ThunderboltMode::cable_mode_vdo(ctx)
                    .map(|vdo| vdo.tbt_mode() && vdo.rounded() == TbtRounded::Gen3Gen4Rounded)
                    .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Whether the cable plugs need TBT mode before Enter_USB.
    pub fn tbt_cable_entry_required<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &Ctx<P, B, C>) -> bool {
        let discovery = &ctx.port.discovery[Sop::SopPrime.index()];
        let active = discovery
            .identity
            .first()
            .map(|raw| IdHeader(*raw).product_type_cable() == ProductTypeCable::Active)
            .unwrap_or(false);
        if !active {
            return false;
        }

        let vdm_20 = Self::cable_svdm_version(ctx) >= SvdmVersion::V20;
        let vdo_13 = discovery
            .identity
            .get(3)
            .map(|raw| ActiveCableVdo1(*raw).vdo_version() >= ACTIVE_CABLE_VDO_VERSION_1_3)
            .unwrap_or(false);

        // New cables understand Enter_USB on their plugs directly.
        !(vdm_20 && vdo_13)
    }

    fn cable_svdm_version<P: ProtocolLayer, B: Board, C: Chipset>(ctx: &Ctx<P, B, C>) -> SvdmVersion {
        if ctx.rev(Sop::SopPrime) == usbpd_drp_traits::PdRev::R2_0 {
            SvdmVersion::V10
        } else {
            SvdmVersion::V20
        }
    }

    /// Install the Enter_USB plan on the policy engine.
    ///
    /// The walk covers SOP' and SOP'' for active cables (skipping SOP''
    /// when the near plug reports no controller there), then SOP.
    pub fn request_entry<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        pe: &mut PolicyEngine,
        ctx: &mut Ctx<P, B, C>,
    ) -> bool {
        let discovery = &ctx.port.discovery[Sop::SopPrime.index()];
        let id_header = discovery.identity.first().map(|raw| IdHeader(*raw));

        let (cable_type, speed, active) = match id_header.map(|h| h.product_type_cable()) {
            Some(ProductTypeCable::Active) => {
                let vdo1 = discovery.identity.get(3).map(|raw| ActiveCableVdo1(*raw));
                let speed = vdo1.and_then(|vdo| vdo.speed()).unwrap_or_else(|| {
                    // Older cables take their speed from the TBT VDO.
                    match ThunderboltMode::cable_mode_vdo(ctx).map(|vdo| vdo.cable_speed()) {
                        Some(TbtCableSpeed::TbtGen3) => UsbSpeed::Usb40Gen3,
                        _ => UsbSpeed::Usb32Gen2,
                    }
                });
                (CableType::ActiveRetimer, speed, true)
            }
            Some(ProductTypeCable::Passive) => {
                let speed = discovery
                    .identity
                    .get(3)
                    .and_then(|raw| PassiveCableVdo(*raw).speed())
                    .unwrap_or(UsbSpeed::Usb32Gen1);
                (CableType::Passive, speed, false)
            }
            _ => return false,
        };

        let eudo = EnterUsbDo::new_usb4(speed, cable_type);

        let mut sops: Vec<Sop, 3> = Vec::new();
        if active {
            let _ = sops.push(Sop::SopPrime);
            let has_sop_pp = discovery
                .identity
                .get(3)
                .map(|raw| ActiveCableVdo1(*raw).sop_pp_controller())
                .unwrap_or(false);
            if has_sop_pp {
                let _ = sops.push(Sop::SopPrimePrime);
            }
        }
        let _ = sops.push(Sop::Sop);

        pe.enter_usb = Some(crate::pe::EnterUsbPlan { eudo: eudo.0, sops });
        ctx.port.post_dpm_request(crate::port::DpmRequest::ENTER_USB);
        self.state = Usb4State::EnterRequested;
        true
    }

    /// Consume the policy engine's Enter_USB outcome.
    pub fn note_outcome<P: ProtocolLayer, B: Board, C: Chipset>(
        &mut self,
        pe: &mut PolicyEngine,
        ctx: &mut Ctx<P, B, C>,
    ) {
        let Some(success) = pe.enter_usb_outcome.take() else {
            return;
        };

        if self.state != Usb4State::EnterRequested {
            return;
        }

        if success {
            let flipped = ctx.port.polarity.map(|p| p.is_flipped()).unwrap_or(false);
            ctx.board.mux_set(ctx.port.id, MuxMode::Usb4, flipped);
            ctx.port.set_flag(PeFlag::MODAL_OPERATION);
            info!("C{}: USB4 active", ctx.id());
            self.state = Usb4State::Active;
        } else {
            // Fall back to plain USB after a refused entry.
            let flipped = ctx.port.polarity.map(|p| p.is_flipped()).unwrap_or(false);
            ctx.board.mux_set(ctx.port.id, MuxMode::Usb, flipped);
            self.state = Usb4State::Inactive;
        }
    }
}

impl Default for Usb4Mode {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use heapless::Vec;
    use usbpd_drp_traits::Sop;

    use super::Usb4Mode;
    use crate::dummy::Bench;
    use crate::message::vdm::{
        ACTIVE_CABLE_VDO_VERSION_1_3, ActiveCableVdo1, ActiveCableVdo2, IdHeader, PassiveCableVdo, TbtModeVdo, UfpVdo,
    };
    use crate::port::{DiscState, SvidModes};

    fn partner_usb4_hub(bench: &mut Bench) {
        let discovery = &mut bench.port.discovery[Sop::Sop.index()];
        discovery.identity = Vec::from_slice(&[
            IdHeader(0).with_product_type(0b001).with_modal_supported(true).0,
            0,
            0,
            UfpVdo(0).with_device_capability(0b1000).0,
        ])
        .unwrap();
        discovery.identity_state = DiscState::Complete;
    }

    fn active_cable(bench: &mut Bench, vdo_version: u8, usb4_bit: bool) {
        let discovery = &mut bench.port.discovery[Sop::SopPrime.index()];
        discovery.identity = Vec::from_slice(&[
            IdHeader(0).with_product_type(0b100).with_modal_supported(true).0,
            0,
            0,
            ActiveCableVdo1(0)
                .with_vdo_version(vdo_version)
                .with_usb_highest_speed(0b011)
                .with_sop_pp_controller(true)
                .0,
            ActiveCableVdo2(0).with_usb_40_support(usb4_bit).0,
        ])
        .unwrap();
        discovery.identity_state = DiscState::Complete;
    }

    #[test]
    fn modern_active_cable_uses_the_usb4_bit() {
        let mut bench = Bench::new();
        partner_usb4_hub(&mut bench);
        active_cable(&mut bench, ACTIVE_CABLE_VDO_VERSION_1_3, true);

        let ctx = &mut bench.ctx(0);
        assert!(Usb4Mode::partner_is_capable(ctx));
        assert!(Usb4Mode::cable_is_capable(ctx));
        assert!(!Usb4Mode::tbt_cable_entry_required(ctx));
    }

    #[test]
    fn modern_active_cable_without_usb4_bit_is_refused() {
        let mut bench = Bench::new();
        partner_usb4_hub(&mut bench);
        active_cable(&mut bench, ACTIVE_CABLE_VDO_VERSION_1_3, false);

        let ctx = &mut bench.ctx(0);
        assert!(!Usb4Mode::cable_is_capable(ctx));
    }

    #[test]
    fn old_active_cable_falls_back_to_tbt_evidence() {
        let mut bench = Bench::new();
        partner_usb4_hub(&mut bench);
        // VDO version predates the USB4 bit.
        active_cable(&mut bench, 0b001, false);

        // Without a TBT mode response, no USB4.
        {
            let ctx = &mut bench.ctx(0);
            assert!(!Usb4Mode::cable_is_capable(ctx));
            assert!(Usb4Mode::tbt_cable_entry_required(ctx));
        }

        // The rounded Gen3/Gen4 TBT response makes it eligible.
        let tbt_vdo = TbtModeVdo(0)
            .with_intel_mode(0x0001)
            .with_cable_speed(0b011)
            .with_rounded(0b01)
            .0;
        let discovery = &mut bench.port.discovery[Sop::SopPrime.index()];
        discovery
            .modes
            .push(SvidModes {
                svid: crate::message::vdm::INTEL_VID,
                modes: Vec::from_slice(&[tbt_vdo]).unwrap(),
            })
            .unwrap();

        let ctx = &mut bench.ctx(0);
        assert!(Usb4Mode::cable_is_capable(ctx));
    }

    #[test]
    fn passive_cable_needs_gen1_or_better(){
        let mut bench = Bench::new();
        partner_usb4_hub(&mut bench);

        let discovery = &mut bench.port.discovery[Sop::SopPrime.index()];
        discovery.identity = Vec::from_slice(&[
            IdHeader(0).with_product_type(0b011).0,
            0,
            0,
            PassiveCableVdo(0).with_usb_highest_speed(0b000).0,
        ])
        .unwrap();
        discovery.identity_state = DiscState::Complete;

        {
            let ctx = &mut bench.ctx(0);
            // USB 2.0 only: not eligible.
            assert!(!Usb4Mode::cable_is_capable(ctx));
        }

        let discovery = &mut bench.port.discovery[Sop::SopPrime.index()];
        discovery.identity[3] = PassiveCableVdo(0).with_usb_highest_speed(0b001).0;

        let ctx = &mut bench.ctx(0);
        assert!(Usb4Mode::cable_is_capable(ctx));
        assert!(!Usb4Mode::tbt_cable_entry_required(ctx));
    }

    #[test]
    fn entry_plan_walks_cable_plugs_then_partner() {
        let mut bench = Bench::new();
        partner_usb4_hub(&mut bench);
        active_cable(&mut bench, ACTIVE_CABLE_VDO_VERSION_1_3, true);

        let mut usb4 = Usb4Mode::new();
        let mut pe = crate::pe::PolicyEngine::new();
        {
            let mut ctx = bench.ctx(0);
            assert!(usb4.request_entry(&mut pe, &mut ctx));
        }

        let plan = pe.enter_usb.as_ref().expect("plan installed");
        assert_eq!(
            plan.sops.as_slice(),
            &[Sop::SopPrime, Sop::SopPrimePrime, Sop::Sop]
        );
        assert!(bench.port.check_dpm_request(crate::port::DpmRequest::ENTER_USB));
    }

    #[test]
    fn entry_plan_skips_sop_pp_without_far_controller() {
        let mut bench = Bench::new();
        partner_usb4_hub(&mut bench);
        active_cable(&mut bench, ACTIVE_CABLE_VDO_VERSION_1_3, true);

        // Near plug reports no SOP'' controller.
        let discovery = &mut bench.port.discovery[Sop::SopPrime.index()];
        let vdo1 = ActiveCableVdo1(discovery.identity[3]).with_sop_pp_controller(false);
        discovery.identity[3] = vdo1.0;

        let mut usb4 = Usb4Mode::new();
        let mut pe = crate::pe::PolicyEngine::new();
        {
            let mut ctx = bench.ctx(0);
            assert!(usb4.request_entry(&mut pe, &mut ctx));
        }

        let plan = pe.enter_usb.as_ref().unwrap();
        assert_eq!(plan.sops.as_slice(), &[Sop::SopPrime, Sop::Sop]);
    }
}
