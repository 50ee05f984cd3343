//! Per-session bus state: frame counter, device address and data toggles

use protocol::Direction;
use protocol::bus::sof_packet;

/// Frame numbers are 11 bits wide
const FRAME_NUMBER_MODULUS: u16 = 2048;

/// Toggle slot of the default control pipe
pub const CONTROL_SLOT: usize = 0;

/// One DATA0/DATA1 bit per (direction, endpoint) pair
///
/// Slot `direction * 16 + endpoint`; `false` is DATA0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointToggles {
    bits: u32,
}

impl EndpointToggles {
    pub fn slot(direction: Direction, endpoint: u8) -> usize {
        direction.as_u32() as usize * 16 + (endpoint & 0x0F) as usize
    }

    pub fn get(&self, slot: usize) -> bool {
        (self.bits >> slot) & 1 == 1
    }

    pub fn flip(&mut self, slot: usize) {
        self.bits ^= 1 << slot;
    }

    /// Back to DATA0
    pub fn reset(&mut self, slot: usize) {
        self.bits &= !(1 << slot);
    }
}

/// Mutable state of one bridge session
///
/// Created when a client/simulator pair is accepted and dropped with the
/// session. Only the coordinator thread touches it.
#[derive(Debug, Clone)]
pub struct BridgeSession {
    frame_number: u16,
    address: u8,
    address_assigned: bool,
    toggles: EndpointToggles,
}

impl BridgeSession {
    pub fn new(address: u8) -> Self {
        Self {
            frame_number: 0,
            address: address & 0x7F,
            address_assigned: false,
            toggles: EndpointToggles::default(),
        }
    }

    /// Start counting frames from `frame_number` instead of 0
    pub fn with_frame_number(mut self, frame_number: u16) -> Self {
        self.frame_number = frame_number % FRAME_NUMBER_MODULUS;
        self
    }

    /// SOF for the current frame; advances the frame counter
    pub fn next_sof(&mut self) -> [u8; 3] {
        let packet = sof_packet(self.frame_number);
        self.frame_number = (self.frame_number + 1) % FRAME_NUMBER_MODULUS;
        packet
    }

    pub fn frame_number(&self) -> u16 {
        self.frame_number
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_address_assigned(&self) -> bool {
        self.address_assigned
    }

    pub(crate) fn mark_address_assigned(&mut self) {
        self.address_assigned = true;
    }

    pub fn toggles(&self) -> &EndpointToggles {
        &self.toggles
    }

    pub(crate) fn toggles_mut(&mut self) -> &mut EndpointToggles {
        &mut self.toggles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::BusPacket;

    #[test]
    fn test_toggle_slots() {
        assert_eq!(EndpointToggles::slot(Direction::Out, 0), CONTROL_SLOT);
        assert_eq!(EndpointToggles::slot(Direction::Out, 2), 2);
        assert_eq!(EndpointToggles::slot(Direction::In, 1), 17);
        assert_eq!(EndpointToggles::slot(Direction::In, 15), 31);
    }

    #[test]
    fn test_toggles_are_independent() {
        let mut toggles = EndpointToggles::default();
        toggles.flip(17);
        assert!(toggles.get(17));
        assert!(!toggles.get(1));

        toggles.flip(17);
        assert!(!toggles.get(17));

        toggles.flip(31);
        toggles.reset(31);
        assert!(!toggles.get(31));
    }

    #[test]
    fn test_sof_advances_frame() {
        let mut session = BridgeSession::new(6);
        assert_eq!(session.next_sof(), sof_packet(0));
        assert_eq!(session.next_sof(), sof_packet(1));
        assert_eq!(session.frame_number(), 2);
    }

    #[test]
    fn test_frame_number_wraps() {
        let mut session = BridgeSession::new(6).with_frame_number(2047);
        let sof = session.next_sof();
        assert_eq!(
            BusPacket::parse(&sof).unwrap(),
            BusPacket::Sof { frame_number: 2047 }
        );
        assert_eq!(session.frame_number(), 0);
    }

    #[test]
    fn test_new_session_is_unassigned() {
        let session = BridgeSession::new(6);
        assert_eq!(session.address(), 6);
        assert!(!session.is_address_assigned());
        assert_eq!(*session.toggles(), EndpointToggles::default());
    }
}
