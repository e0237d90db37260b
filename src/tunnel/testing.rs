//! Test doubles for the tunnel seams

use parking_lot::Mutex;

use super::{Decapsulated, PacketSink, TunnelCipher};
use crate::error::InterceptError;

/// Identity cipher: the datagram is the packet
#[derive(Debug, Default)]
pub(crate) struct ClearCipher;

impl TunnelCipher for ClearCipher {
    fn encapsulate(&self, packet: &[u8]) -> Result<Option<Vec<u8>>, InterceptError> {
        Ok(Some(packet.to_vec()))
    }

    fn decapsulate(&self, datagram: &[u8]) -> Result<Decapsulated, InterceptError> {
        Ok(Decapsulated {
            packets: vec![datagram.to_vec()],
            to_network: Vec::new(),
        })
    }

    fn update_timers(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

/// Sink that records every transmitted packet
#[derive(Debug, Default)]
pub(crate) struct CaptureSink {
    packets: Mutex<Vec<Vec<u8>>>,
}

impl CaptureSink {
    pub(crate) fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.packets.lock())
    }

    pub(crate) fn len(&self) -> usize {
        self.packets.lock().len()
    }
}

impl PacketSink for CaptureSink {
    fn transmit(&self, packet: &[u8]) -> Result<(), InterceptError> {
        self.packets.lock().push(packet.to_vec());
        Ok(())
    }
}
