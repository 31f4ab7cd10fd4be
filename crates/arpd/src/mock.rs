//! In-process stand-ins for the forwarding plane and raw sockets
//!
//! Used by the test suites and for running the daemon without hardware.

use crate::capture::{FrameSource, PacketIo};
use crate::error::{ArpdError, Result};
use crate::hardware::{HardwarePlane, NeighborProgram};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Recorded forwarding-plane command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareCall {
    Create(NeighborProgram),
    Update(NeighborProgram),
    Delete(NeighborProgram),
}

impl HardwareCall {
    pub fn ip(&self) -> Ipv4Addr {
        match self {
            HardwareCall::Create(n) | HardwareCall::Update(n) | HardwareCall::Delete(n) => n.ip,
        }
    }

    pub fn op(&self) -> HardwareOp {
        match self {
            HardwareCall::Create(_) => HardwareOp::Create,
            HardwareCall::Update(_) => HardwareOp::Update,
            HardwareCall::Delete(_) => HardwareOp::Delete,
        }
    }
}

/// Kind of forwarding-plane command, for targeted failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareOp {
    Create,
    Update,
    Delete,
}

/// Hardware plane that records every call and can be told to fail
#[derive(Debug, Default)]
pub struct MockHardwarePlane {
    calls: Mutex<Vec<HardwareCall>>,
    failing: AtomicBool,
    failing_ops: Mutex<HashSet<HardwareOp>>,
}

impl MockHardwarePlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail (and not be recorded)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes only calls of kind `op` fail
    pub fn set_failing_op(&self, op: HardwareOp, failing: bool) {
        let mut ops = self.failing_ops.lock();
        if failing {
            ops.insert(op);
        } else {
            ops.remove(&op);
        }
    }

    pub fn calls(&self) -> Vec<HardwareCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: HardwareCall) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) || self.failing_ops.lock().contains(&call.op()) {
            return Err(ArpdError::hardware(call.ip(), "injected failure"));
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl HardwarePlane for MockHardwarePlane {
    async fn create_neighbor(&self, neighbor: &NeighborProgram) -> Result<()> {
        self.record(HardwareCall::Create(*neighbor))
    }

    async fn update_neighbor(&self, neighbor: &NeighborProgram) -> Result<()> {
        self.record(HardwareCall::Update(*neighbor))
    }

    async fn delete_neighbor(&self, neighbor: &NeighborProgram) -> Result<()> {
        self.record(HardwareCall::Delete(*neighbor))
    }
}

/// Packet I/O loopback: injected frames are recorded, captures are fed by hand
#[derive(Debug, Default)]
pub struct LoopbackIo {
    injected: Mutex<Vec<(String, Vec<u8>)>>,
    feeds: Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
    failing: Mutex<HashSet<String>>,
}

impl LoopbackIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames transmitted so far as `(port name, frame)`
    pub fn injected(&self) -> Vec<(String, Vec<u8>)> {
        self.injected.lock().clone()
    }

    pub fn clear_injected(&self) {
        self.injected.lock().clear();
    }

    /// Fails capture and injection on the named port
    pub fn fail_port(&self, port_name: &str) {
        self.failing.lock().insert(port_name.to_string());
    }

    /// Delivers a frame to the open capture on `port_name`
    pub fn feed(&self, port_name: &str, frame: Vec<u8>) -> bool {
        self.feeds
            .lock()
            .get(port_name)
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Whether a receive loop currently holds the port's capture
    pub fn is_capturing(&self, port_name: &str) -> bool {
        self.feeds
            .lock()
            .get(port_name)
            .is_some_and(|tx| !tx.is_closed())
    }

    fn check(&self, port_name: &str) -> Result<()> {
        if self.failing.lock().contains(port_name) {
            return Err(ArpdError::capture(port_name, "injected failure"));
        }
        Ok(())
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().await.ok_or(ArpdError::ChannelClosed)
    }
}

impl PacketIo for LoopbackIo {
    fn open_capture(&self, port_name: &str) -> Result<Box<dyn FrameSource>> {
        self.check(port_name)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().insert(port_name.to_string(), tx);
        Ok(Box::new(ChannelSource { rx }))
    }

    fn inject(&self, port_name: &str, frame: &[u8]) -> Result<()> {
        self.check(port_name)?;
        self.injected
            .lock()
            .push((port_name.to_string(), frame.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MacAddress;

    #[tokio::test]
    async fn test_mock_hardware_failure_not_recorded() {
        let plane = MockHardwarePlane::new();
        let program = NeighborProgram {
            ip: Ipv4Addr::new(10, 0, 0, 1),
            mac: MacAddress::BROADCAST,
            vlan: None,
            if_index: 1,
        };
        plane.create_neighbor(&program).await.unwrap();
        plane.set_failing(true);
        assert!(plane.delete_neighbor(&program).await.is_err());
        assert_eq!(plane.calls(), vec![HardwareCall::Create(program)]);
    }

    #[tokio::test]
    async fn test_mock_hardware_fails_single_op() {
        let plane = MockHardwarePlane::new();
        let program = NeighborProgram {
            ip: Ipv4Addr::new(10, 0, 0, 1),
            mac: MacAddress::BROADCAST,
            vlan: None,
            if_index: 1,
        };
        plane.set_failing_op(HardwareOp::Create, true);
        assert!(plane.create_neighbor(&program).await.is_err());
        plane.delete_neighbor(&program).await.unwrap();
        assert_eq!(plane.calls(), vec![HardwareCall::Delete(program)]);

        plane.set_failing_op(HardwareOp::Create, false);
        plane.create_neighbor(&program).await.unwrap();
        assert_eq!(plane.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_loopback_capture_feed() {
        let io = LoopbackIo::new();
        assert!(!io.feed("Ethernet0", vec![1, 2, 3]));

        let mut source = io.open_capture("Ethernet0").unwrap();
        assert!(io.is_capturing("Ethernet0"));
        assert!(io.feed("Ethernet0", vec![1, 2, 3]));
        assert_eq!(source.next_frame().await.unwrap(), vec![1, 2, 3]);

        drop(source);
        assert!(!io.is_capturing("Ethernet0"));
    }
}
