use std::sync::Arc;
use std::time::Duration;

use liaison_core::types::Metadata;
use liaison_devices::discovery::PortInfo;
use liaison_devices::transport::LoopbackBus;
use liaison_devices::{
    register_default_factories, DeviceContext, Response, ResponseListener, SharedDeviceRegistry,
};

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

struct PrintListener;

impl ResponseListener for PrintListener {
    fn on_response(&self, response: &Response) {
        info!(
            "{} t={:.3} value={} channel={} code={}",
            response.class.name(),
            response.t,
            response.value,
            response.channel,
            response.code
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // A simulated FTDI adapter so port detection finds the pad
    let bus = LoopbackBus::new();
    let ports = vec![PortInfo::new("/dev/ttyUSB0")
        .with_manufacturer("FTDI")
        .with_description("FT232R USB UART")];

    let registry = SharedDeviceRegistry::new();
    register_default_factories(registry.registry(), DeviceContext::loopback(bus.clone(), ports));

    let registration = registry.registry().add_device("TPad", "pad", Metadata::new())?;
    info!("Registered {:?}", registration);

    let pad = registry.registry().get_device("pad")?;
    pad.add_listener(Arc::new(PrintListener))?;

    let link = bus.link("/dev/ttyUSB0");
    info!("Sent to pad: {:?}", link.sent());

    // Button 1 pressed and released, then photodiode 2 onset
    link.push_line("A P 1 120");
    link.push_line("A R 1 340");
    link.push_line("CP]900");

    tokio::time::sleep(Duration::from_millis(200)).await;

    let photodiode = registry.registry().get_device("pad.photodiode2")?;
    info!("photodiode2 state: {}", photodiode.state().await?);

    registry.registry().shutdown_all_devices().await?;
    Ok(())
}
