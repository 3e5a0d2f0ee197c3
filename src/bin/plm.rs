use std::path::PathBuf;

use anyhow::{Context, Result};

use structopt::StructOpt;

use prettytable::{format::FormatBuilder, row, table, Table};

use log::debug;

use plm::*;

#[derive(StructOpt, Debug)]
#[structopt(name = "plm")]
struct App {
    /// A path to a serial device with an INSTEON modem connected, e.g. /dev/ttyUSB0
    #[structopt(short, long, parse(from_os_str), conflicts_with = "host", required_unless = "host")]
    device: Option<PathBuf>,

    /// A host (optionally host:port) to connect over TCP
    #[structopt(short, long, conflicts_with = "device", required_unless = "device")]
    host: Option<String>,

    #[structopt(subcommand)]
    command: AppCommand,
}

#[derive(StructOpt, Debug)]
enum AppCommand {
    Modem(ModemCommand),
    Device(DeviceCommand),
}

#[derive(StructOpt, Debug)]
#[structopt(about = "Modem commands")]
enum ModemCommand {
    /// Query the attached modem's own identity.
    Info,
    /// Dump the modem's on-board all-link database.
    Links,
}

#[derive(StructOpt, Debug)]
struct DeviceFlags {
    /// Address of the device, e.g. 11.22.33
    address: Address,
}

#[derive(StructOpt, Debug)]
#[structopt(about = "Device commands")]
enum DeviceCommand {
    /// Turn a device on.
    On {
        #[structopt(flatten)]
        common: DeviceFlags,

        /// The level to set for dimmable devices, 0-255. Defaults to full.
        #[structopt(short, long, default_value = "255")]
        level: u8,
    },
    /// Turn a device off.
    Off {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Turn a device off without ramping.
    FastOff {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Start brightening a dimmer.
    Bright {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Start dimming a dimmer.
    Dim {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Begin a manual brighten/dim ramp.
    StartManualChange {
        #[structopt(flatten)]
        common: DeviceFlags,

        /// Ramp brighter instead of dimmer.
        #[structopt(short, long)]
        bright: bool,
    },
    /// Stop an in-progress manual brighten/dim ramp.
    StopManualChange {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Ping a device.
    Ping {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Query the device's ID (engine broadcast re-query).
    IdRequest {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Retrieve current device status (light level, database delta).
    Status {
        #[structopt(flatten)]
        common: DeviceFlags,

        /// Query KeypadLinc button LED states instead of light level.
        #[structopt(long)]
        kpl_led: bool,
    },
    /// Retrieve the device's INSTEON engine version.
    EngineVersion {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Request the device's product data (category/subcategory/firmware).
    ProductData {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Request the device's current lighting-effect (FX) name.
    FxName {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
    /// Request the device's free-form text string.
    DeviceText {
        #[structopt(flatten)]
        common: DeviceFlags,
    },
}

fn create_table() -> Table {
    let mut table = Table::new();
    let format = FormatBuilder::new().column_separator(' ').padding(0, 1).build();

    table.set_format(format);
    table
}

macro_rules! ptable {
	($($e:tt), +) => {
		let mut table = table!($($e),+);
		let format = FormatBuilder::new()
			.column_separator(' ')
			.padding(0, 1)
			.build();

		table.set_format(format);
		table.printstd();
    };
}

async fn modem_info(session: &Session) -> Result<()> {
    let info = session.send_get_im_info().await.context("failed to query modem info")?;

    ptable!(
        ["Address", info.address],
        ["Category", format!("{:#04x}", info.category)],
        ["Subcategory", format!("{:#04x}", info.subcategory)],
        ["Firmware Version", format!("{:#04x}", info.firmware)]
    );
    Ok(())
}

async fn modem_links(session: &Session) -> Result<()> {
    let links = session.get_all_link_database().await.context("failed to read all-link database")?;

    let mut table = create_table();
    table.set_titles(row![b->"Address", b->"Mode", b->"Group"]);

    for link in links {
        // It's useless to display all of the flags, since every record
        // will have IN_USE and most will have HAS_BEEN_USED.
        let mode = if link.flags.contains(AllLinkFlags::IS_CONTROLLER) {
            "Controller"
        } else {
            "Responder"
        };

        table.add_row(row![link.to, mode, link.group]);
    }

    table.printstd();
    Ok(())
}

async fn handle_device_command(session: &Session, command: DeviceCommand) -> Result<()> {
    match command {
        DeviceCommand::On { common, level } => {
            session.device(common.address).send_on(level, None).await.context("send on failed")?;
        }
        DeviceCommand::Off { common } => {
            session.device(common.address).send_off(None).await.context("send off failed")?;
        }
        DeviceCommand::FastOff { common } => {
            session.device(common.address).send_fast_off().await.context("send fast-off failed")?;
        }
        DeviceCommand::Bright { common } => {
            session.device(common.address).send_bright().await.context("send bright failed")?;
        }
        DeviceCommand::Dim { common } => {
            session.device(common.address).send_dim().await.context("send dim failed")?;
        }
        DeviceCommand::StartManualChange { common, bright } => {
            let direction = if bright { ManualChangeDirection::Bright } else { ManualChangeDirection::Dim };
            session
                .device(common.address)
                .send_start_manual_change(direction)
                .await
                .context("start manual change failed")?;
        }
        DeviceCommand::StopManualChange { common } => {
            session
                .device(common.address)
                .send_stop_manual_change()
                .await
                .context("stop manual change failed")?;
        }
        DeviceCommand::Ping { common } => {
            session.device(common.address).send_ping().await.context("ping failed")?;
        }
        DeviceCommand::IdRequest { common } => {
            session.device(common.address).send_id_request().await.context("id request failed")?;
        }
        DeviceCommand::Status { common, kpl_led } => {
            let status = session
                .device(common.address)
                .send_status_request(kpl_led)
                .await
                .context("status request failed")?;
            ptable!(
                ["Database Delta", format!("{:#04x}", status.db_delta)],
                ["Level", format!("{}%", status.level_percent)]
            );
        }
        DeviceCommand::EngineVersion { common } => {
            session
                .device(common.address)
                .send_get_engine_version()
                .await
                .context("engine version request failed")?;
        }
        DeviceCommand::ProductData { common } => {
            session
                .device(common.address)
                .send_product_data_request()
                .await
                .context("product data request failed")?;
        }
        DeviceCommand::FxName { common } => {
            session.device(common.address).send_fx_name_request().await.context("fx name request failed")?;
        }
        DeviceCommand::DeviceText { common } => {
            session
                .device(common.address)
                .send_device_text_string_request()
                .await
                .context("device text request failed")?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let app = App::from_args();
    debug!("{:#?}", app);

    let session = if let Some(device) = app.device {
        Session::connect_serial(&device).with_context(|| format!("failed to open {}", device.display()))?
    } else {
        Session::connect_tcp(&app.host.unwrap()).await.context("failed to connect")?
    };
    session.ready().await;

    match app.command {
        AppCommand::Modem(ModemCommand::Info) => modem_info(&session).await?,
        AppCommand::Modem(ModemCommand::Links) => modem_links(&session).await?,
        AppCommand::Device(command) => handle_device_command(&session, command).await?,
    }

    Ok(())
}
