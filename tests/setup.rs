mod common;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use amb_bridge::bridge::Bridge;
use amb_bridge::can::Frame;
use amb_bridge::config::{BridgeConfig, BridgeMode, NodeConfig, CALLBACK_CAPACITY};
use amb_bridge::handlers::{
    AmbientTemperature, Diagnostics, FirmwareVersion, FixedPoints, ForwardHandler, SetupInfo,
};
use amb_bridge::identity::{NodeIdentity, Revision};
use amb_bridge::link::{setup_status, LinkStatus};
use amb_bridge::node::{Dispatch, Node};
use amb_bridge::queue::TransactionQueue;
use amb_bridge::setup::{RangeKind, RcaRange, SetupError, SetupSequence, SetupState};

use common::{range_reply, Counting, MockCan, MockPort, SERIAL};

type Queue = TransactionQueue<CriticalSectionRawMutex, 8>;

const BASE: u32 = 0x40000;

fn config() -> BridgeConfig {
    BridgeConfig {
        max_timeout: 10,
        monitor_retries: 1,
        mode: BridgeMode::Blocking,
    }
}

fn ready(setup: &mut SetupSequence, bridge: &mut Bridge<'_, MockPort>) {
    setup.init_ports(bridge);
    assert!(setup.poll_downstream_ready(bridge));
}

#[test]
fn downstream_ready_gates_setup() {
    let link = LinkStatus::new();
    let mut port = MockPort::new();
    port.ready = false;
    let mut bridge = Bridge::new(port, config(), &link);
    let mut setup = SetupSequence::new();

    assert!(!setup.poll_downstream_ready(&mut bridge));
    assert_eq!(setup.state(), SetupState::NotReady);

    setup.init_ports(&mut bridge);
    assert_eq!(bridge.port_mut().select_toggles, 2);
    assert!(!setup.poll_downstream_ready(&mut bridge));
    assert_eq!(setup.state(), SetupState::WaitingForDownstreamReady);
    assert!(!link.ready());

    bridge.port_mut().ready = true;
    assert!(setup.poll_downstream_ready(&mut bridge));
    assert_eq!(setup.state(), SetupState::Ready);
    assert!(link.downstream_ready());
    assert!(link.ready());
}

#[test]
fn setup_before_ready_is_refused() {
    let queue = Queue::new();
    let forward = ForwardHandler::new(&queue);
    let link = LinkStatus::new();
    let mut bridge = Bridge::new(MockPort::new(), config(), &link);
    let mut node: Node<'_, 4> = Node::new(NodeIdentity::new(&NodeConfig::new(0), SERIAL));
    let mut setup = SetupSequence::new();

    assert_eq!(
        setup.run(&mut bridge, &mut node, &forward),
        Err(SetupError::NotReady)
    );
    assert!(bridge.port_mut().written.is_empty());
    assert_eq!(link.setup_status(), setup_status::NOT_READY);
}

#[test]
fn learns_ranges_and_registers_them_behind_fixed_points() {
    let queue = Queue::new();
    let link = LinkStatus::new();
    let version = FirmwareVersion::new(Revision::new(1, 3, 0));
    let setup_info = SetupInfo::new(&link);
    let diagnostics = Diagnostics::new(&link, &queue, 10);
    let ambient = AmbientTemperature::new();
    let forward = ForwardHandler::new(&queue);

    let mut node: Node<'_, CALLBACK_CAPACITY> =
        Node::new(NodeIdentity::new(&NodeConfig::new(0), SERIAL));
    FixedPoints {
        version: &version,
        setup_info: &setup_info,
        diagnostics: &diagnostics,
        ambient: &ambient,
    }
    .register(&mut node)
    .unwrap();

    let port = MockPort::with_replies([
        range_reply(0x00000, 0x00FFF),
        range_reply(0x01000, 0x01FFF),
        range_reply(0x02000, 0x0FFFF),
        range_reply(0x10000, 0x1FFFF),
    ]);
    let mut bridge = Bridge::new(port, config(), &link);
    let mut setup = SetupSequence::new();
    ready(&mut setup, &mut bridge);

    let table = setup.run(&mut bridge, &mut node, &forward).unwrap();

    assert_eq!(
        table.get(RangeKind::Monitor),
        RcaRange {
            low: 0x02000,
            high: 0x0FFFF
        }
    );
    assert_eq!(table.get(RangeKind::Control).high, 0x1FFFF);
    assert!(setup.is_initialized());
    assert_eq!(setup.ranges(), Some(&table));
    assert_eq!(node.registry().len(), 8);
    assert!(link.initialized());
    assert_eq!(link.setup_status(), setup_status::ALREADY_DONE);
    assert_eq!(
        &bridge.port_mut().written[..5],
        &[0x03, 0x00, 0x02, 0x00, 0x00]
    );

    // learned ranges reach the bridge, fixed points answer directly
    let mut can = MockCan::default();
    let frame = Frame::from_raw(BASE + 0x3000, &[]).unwrap();
    assert_eq!(
        node.on_frame(&frame, false, &mut can).unwrap(),
        Dispatch::Handled { replied: false }
    );
    assert_eq!(queue.len(), 1);

    let frame = Frame::from_raw(BASE + 0x20001, &[]).unwrap();
    node.on_frame(&frame, false, &mut can).unwrap();
    assert_eq!(can.replies(), vec![(BASE + 0x20001, vec![0x05])]);

    assert_eq!(
        setup.run(&mut bridge, &mut node, &forward),
        Err(SetupError::AlreadyInitialized)
    );
    assert_eq!(node.registry().len(), 8);
}

#[test]
fn timeout_rolls_back_only_learned_ranges() {
    let queue = Queue::new();
    let link = LinkStatus::new();
    let version = FirmwareVersion::new(Revision::new(1, 3, 0));
    let setup_info = SetupInfo::new(&link);
    let diagnostics = Diagnostics::new(&link, &queue, 10);
    let ambient = AmbientTemperature::new();
    let forward = ForwardHandler::new(&queue);

    let mut node: Node<'_, CALLBACK_CAPACITY> =
        Node::new(NodeIdentity::new(&NodeConfig::new(0), SERIAL));
    FixedPoints {
        version: &version,
        setup_info: &setup_info,
        diagnostics: &diagnostics,
        ambient: &ambient,
    }
    .register(&mut node)
    .unwrap();
    let before: Vec<_> = node.registry().ranges().collect();

    let port = MockPort::with_replies([
        range_reply(0x00000, 0x00FFF),
        range_reply(0x01000, 0x01FFF),
        None,
        None,
    ]);
    let mut bridge = Bridge::new(port, config(), &link);
    let mut setup = SetupSequence::new();
    ready(&mut setup, &mut bridge);

    let mut registrar = Counting::new(&mut node);
    let result = setup.run(&mut bridge, &mut registrar, &forward);

    assert_eq!(result, Err(SetupError::Timeout(RangeKind::Monitor)));
    assert_eq!(registrar.registered, 2);
    assert_eq!(registrar.unregistered, 2);
    assert_eq!(node.registry().ranges().collect::<Vec<_>>(), before);
    assert_eq!(setup.state(), SetupState::Ready);
    assert!(!setup.is_initialized());
    assert!(!link.initialized());
    assert_eq!(link.setup_status(), setup_status::TIMEOUT);
}

#[test]
fn full_registry_rolls_back() {
    let queue = Queue::new();
    let forward = ForwardHandler::new(&queue);
    let link = LinkStatus::new();
    let mut node: Node<'_, 1> = Node::new(NodeIdentity::new(&NodeConfig::new(0), SERIAL));

    let port = MockPort::with_replies([
        range_reply(0x00000, 0x00FFF),
        range_reply(0x01000, 0x01FFF),
    ]);
    let mut bridge = Bridge::new(port, config(), &link);
    let mut setup = SetupSequence::new();
    ready(&mut setup, &mut bridge);

    assert_eq!(
        setup.run(&mut bridge, &mut node, &forward),
        Err(SetupError::RegistryFull(RangeKind::SpecialControl))
    );
    assert!(node.registry().is_empty());
    assert_eq!(link.setup_status(), setup_status::TIMEOUT);
}

#[test]
fn inverted_range_is_rejected() {
    let queue = Queue::new();
    let forward = ForwardHandler::new(&queue);
    let link = LinkStatus::new();
    let mut node: Node<'_, 4> = Node::new(NodeIdentity::new(&NodeConfig::new(0), SERIAL));

    let port = MockPort::with_replies([range_reply(0x200, 0x100)]);
    let mut bridge = Bridge::new(port, config(), &link);
    let mut setup = SetupSequence::new();
    ready(&mut setup, &mut bridge);

    assert_eq!(
        setup.run(&mut bridge, &mut node, &forward),
        Err(SetupError::InvalidRange(RangeKind::SpecialMonitor))
    );
    assert!(node.registry().is_empty());
}
