#![no_std]
#![no_main]

mod board;

use core::cell::RefCell;

use amb_bridge::bridge::{Bridge, ReplySink, Service};
use amb_bridge::config::{
    BridgeConfig, ControllerConfig, NodeConfig, CALLBACK_CAPACITY, CMD_QUEUE_SIZE, MAX_TIMEOUT,
};
use amb_bridge::ds1820::{Ds1820, SensorError, Temperature, Thermometer};
use amb_bridge::handlers::{
    AmbientTemperature, Diagnostics, FirmwareVersion, FixedPoints, ForwardHandler, SetupInfo,
};
use amb_bridge::i82527::{I82527, SpiRegisters};
use amb_bridge::identity::SlaveError;
use amb_bridge::link::LinkStatus;
use amb_bridge::message::Message;
use amb_bridge::node::Node;
use amb_bridge::queue::TransactionQueue;
use amb_bridge::registry::{Handler, Registrar, RegistryFull};
use amb_bridge::setup::{SetupError, SetupSequence};
use board::{OpenDrain, ParallelLink};
use defmt::{error, info, unwrap, warn, Debug2Format};
use embassy_executor::{InterruptExecutor, Spawner};
use embassy_rp::gpio::{Flex, Input, Level, Output, Pull};
use embassy_rp::interrupt;
use embassy_rp::interrupt::{InterruptExt, Priority};
use embassy_rp::peripherals::{SPI0, UART1};
use embassy_rp::spi::{self, Spi};
use embassy_rp::uart;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{with_timeout, Delay, Duration, Ticker, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use static_cell::StaticCell;
use {defmt_serial as _, panic_probe as _};

// Program metadata for `picotool info`.
#[link_section = ".bi_entries"]
#[used]
pub static PICOTOOL_ENTRIES: [embassy_rp::binary_info::EntryAddr; 4] = [
    embassy_rp::binary_info::rp_program_name!(c"amb-bridge"),
    embassy_rp::binary_info::rp_program_description!(c"CAN monitor and control bridge"),
    embassy_rp::binary_info::rp_cargo_version!(),
    embassy_rp::binary_info::rp_program_build_attribute!(),
];

type CanDevice = ExclusiveDevice<Spi<'static, SPI0, spi::Blocking>, Output<'static>, Delay>;
type Controller = I82527<SpiRegisters<CanDevice>>;
type Queue = TransactionQueue<CriticalSectionRawMutex, CMD_QUEUE_SIZE>;

/// How long the bridge loop waits for a reply strobe before counting one
/// timeout tick.
const STROBE_TICK: Duration = Duration::from_micros(10);
const AMBIENT_PERIOD: Duration = Duration::from_secs(10);
const CONVERSION_POLL: Duration = Duration::from_millis(50);
const CONVERSION_POLLS: usize = 20;

struct Shared {
    node: Node<'static, CALLBACK_CAPACITY>,
    can: Controller,
}

static SHARED: Mutex<CriticalSectionRawMutex, RefCell<Option<Shared>>> =
    Mutex::new(RefCell::new(None));

static QUEUE: Queue = TransactionQueue::new();
static LINK: LinkStatus = LinkStatus::new();
static AMBIENT: AmbientTemperature = AmbientTemperature::new();
static SETUP_INFO: SetupInfo<'static> = SetupInfo::new(&LINK);
static DIAGNOSTICS: Diagnostics<'static, CriticalSectionRawMutex, CMD_QUEUE_SIZE> =
    Diagnostics::new(&LINK, &QUEUE, MAX_TIMEOUT);
static FORWARD: ForwardHandler<'static, CriticalSectionRawMutex, CMD_QUEUE_SIZE> =
    ForwardHandler::new(&QUEUE);

static EXECUTOR_CAN: InterruptExecutor = InterruptExecutor::new();

#[interrupt]
unsafe fn SWI_IRQ_1() {
    EXECUTOR_CAN.on_interrupt()
}

/// Registers learned ranges with the node while the CAN task is live.
struct SharedRegistrar;

impl Registrar<'static> for SharedRegistrar {
    fn register(
        &mut self,
        low_address: u32,
        high_address: u32,
        handler: &'static (dyn Handler + Sync),
    ) -> Result<(), RegistryFull> {
        SHARED.lock(|shared| match shared.borrow_mut().as_mut() {
            Some(shared) => shared.node.register(low_address, high_address, handler),
            None => Err(RegistryFull),
        })
    }

    fn unregister_last(&mut self) -> bool {
        SHARED.lock(|shared| {
            shared
                .borrow_mut()
                .as_mut()
                .is_some_and(|shared| shared.node.unregister_last())
        })
    }
}

/// Sends completed monitor replies out through the controller.
struct SharedReplySink;

impl ReplySink for SharedReplySink {
    fn send_reply(&mut self, reply: &Message) {
        SHARED.lock(|shared| {
            if let Some(Shared { node, can }) = shared.borrow_mut().as_mut() {
                if let Err(e) = node.transmit_reply(reply, can) {
                    error!("reply {:x} not sent: {}", reply.rca, Debug2Format(&e));
                }
            }
        })
    }
}

// can task, runs at interrupt priority
#[embassy_executor::task]
async fn can_task(mut irq: Input<'static>) {
    loop {
        irq.wait_for_low().await;

        let serviced = SHARED.lock(|shared| {
            let mut shared = shared.borrow_mut();
            let Shared { node, can } = shared.as_mut()?;
            match node.service_interrupt(can) {
                Ok(serviced) => Some(serviced),
                Err(e) => {
                    error!("controller access failed: {}", Debug2Format(&e));
                    None
                }
            }
        });

        match serviced {
            Some(serviced) if serviced.reset_requested => {
                warn!("resetting");
                cortex_m::peripheral::SCB::sys_reset();
            }
            Some(_) => {}
            // keep a stuck interrupt line from starving thread mode
            None => Timer::after(Duration::from_millis(1)).await,
        }
    }
}

// bridge task
#[embassy_executor::task]
async fn bridge_task(mut bridge: Bridge<'static, ParallelLink>) {
    let mut setup = SetupSequence::new();
    setup.init_ports(&mut bridge);
    while !setup.poll_downstream_ready(&mut bridge) {
        Timer::after(Duration::from_millis(100)).await;
    }

    loop {
        match setup.run(&mut bridge, &mut SharedRegistrar, &FORWARD) {
            Ok(_) | Err(SetupError::AlreadyInitialized) => break,
            Err(e) => {
                warn!("setup failed: {}, retrying", e);
                Timer::after(Duration::from_millis(100)).await;
            }
        }
    }

    let mut sink = SharedReplySink;
    loop {
        if bridge.waiting()
            && !bridge.take_presented_byte()
            && with_timeout(STROBE_TICK, bridge.port_mut().wait_for_strobe_edge())
                .await
                .is_ok()
        {
            bridge.on_handshake_edge();
        }

        match bridge.service(&QUEUE, &mut sink) {
            Service::Idle => Timer::after(Duration::from_micros(100)).await,
            Service::Dropped => warn!("transaction dropped"),
            Service::Waiting | Service::Forwarded | Service::Replied => {}
        }
    }
}

async fn read_ambient(
    sensor: &mut Ds1820<OpenDrain, Delay>,
) -> Result<Temperature, SensorError> {
    sensor.start_conversion()?;
    for _ in 0..CONVERSION_POLLS {
        Timer::after(CONVERSION_POLL).await;
        if sensor.conversion_done()? {
            return sensor.read_scratchpad();
        }
    }
    Err(SensorError::ConversionTimeout)
}

// ambient temperature task
#[embassy_executor::task]
async fn ambient_task(mut sensor: Ds1820<OpenDrain, Delay>) {
    let mut ticker = Ticker::every(AMBIENT_PERIOD);
    loop {
        match read_ambient(&mut sensor).await {
            Ok(reading) => {
                info!("ambient {} C", reading.celsius());
                AMBIENT.store(reading);
            }
            Err(e) => {
                warn!("temperature read failed: {}", e);
                SHARED.lock(|shared| {
                    if let Some(shared) = shared.borrow().as_ref() {
                        let identity = shared.node.identity();
                        if identity.last_error() != SlaveError::DuplicateAddress {
                            identity.set_last_error(e.slave_error());
                        }
                    }
                });
            }
        }
        ticker.next().await;
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    // init peripherals
    let p = embassy_rp::init(Default::default());

    // init uart
    static UART: StaticCell<uart::Uart<'static, UART1, uart::Blocking>> = StaticCell::new();
    let uart1 = UART.init(uart::Uart::new_blocking(
        p.UART1,
        p.PIN_4, // tx, blue, goes to rx
        p.PIN_5, // rx, white, goes to tx
        uart::Config::default(),
    ));

    // init defmt serial
    defmt_serial::defmt_serial(uart1);

    // node address switch
    let switch = [
        Input::new(p.PIN_21, Pull::Up),
        Input::new(p.PIN_22, Pull::Up),
        Input::new(p.PIN_23, Pull::Up),
        Input::new(p.PIN_24, Pull::Up),
        Input::new(p.PIN_25, Pull::Up),
        Input::new(p.PIN_26, Pull::Up),
    ];
    let config = NodeConfig::new(board::read_node_address(&switch));

    // init 1-wire
    let mut sensor = Ds1820::new(OpenDrain::new(Flex::new(p.PIN_20)), Delay);

    // init can controller
    let mut spi_config = spi::Config::default();
    spi_config.frequency = 1_000_000;
    let spi = Spi::new_blocking(p.SPI0, p.PIN_2, p.PIN_3, p.PIN_0, spi_config);
    let cs = Output::new(p.PIN_1, Level::High);
    let device = unwrap!(ExclusiveDevice::new(spi, cs, Delay));
    let mut can = I82527::new(SpiRegisters::new(device), ControllerConfig::default());

    let mut node = match Node::boot(&config, &mut sensor, &mut can) {
        Ok(node) => node,
        Err(e) => {
            // without a serial number the node must stay off the bus
            error!("boot failed: {}", Debug2Format(&e));
            loop {
                Timer::after(Duration::from_secs(1)).await;
            }
        }
    };

    static VERSION: StaticCell<FirmwareVersion> = StaticCell::new();
    let version: &'static FirmwareVersion =
        VERSION.init(FirmwareVersion::new(node.identity().software_revision()));

    unwrap!(FixedPoints {
        version,
        setup_info: &SETUP_INFO,
        diagnostics: &DIAGNOSTICS,
        ambient: &AMBIENT,
    }
    .register(&mut node));

    match sensor.read_temperature() {
        Ok(reading) => AMBIENT.store(reading),
        Err(e) => node.identity().set_last_error(e.slave_error()),
    }

    SHARED.lock(|shared| shared.replace(Some(Shared { node, can })));

    // init can task
    interrupt::SWI_IRQ_1.set_priority(Priority::P2);
    let can_spawner = EXECUTOR_CAN.start(interrupt::SWI_IRQ_1);
    unwrap!(can_spawner.spawn(can_task(Input::new(p.PIN_19, Pull::Up))));

    // init bridge task
    let data = [
        Flex::new(p.PIN_6),
        Flex::new(p.PIN_7),
        Flex::new(p.PIN_8),
        Flex::new(p.PIN_9),
        Flex::new(p.PIN_10),
        Flex::new(p.PIN_11),
        Flex::new(p.PIN_12),
        Flex::new(p.PIN_13),
    ];
    let link = ParallelLink::new(
        data,
        Output::new(p.PIN_14, Level::Low),
        Output::new(p.PIN_15, Level::Low),
        Input::new(p.PIN_16, Pull::Up),
        Input::new(p.PIN_17, Pull::Up),
        Output::new(p.PIN_18, Level::Low),
    );
    let bridge = Bridge::new(link, BridgeConfig::default(), &LINK);
    unwrap!(spawner.spawn(bridge_task(bridge)));

    // init ambient temperature task
    unwrap!(spawner.spawn(ambient_task(sensor)));

    info!("node {} running", config.node_address);
}
