use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use lywsdread::{Model, SensorClient};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// MAC address(es) of the sensor(s) to poll
    #[arg(required = true, value_name = "MAC")]
    mac: Vec<String>,

    /// Sensor model: lywsd02 or lywsd03
    #[arg(short, long, default_value = "lywsd03")]
    model: Model,

    /// Seconds between polls; with 0 each device is read once
    #[arg(short, long, default_value_t = 0)]
    interval: u64,

    /// Download the hourly history of the first device into this CSV file
    #[arg(long, value_name = "FILE")]
    history_csv: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(path) = &cli.history_csv {
        export_history(&cli.mac[0], cli.model, path)
            .await
            .with_context(|| format!("exporting history from {}", cli.mac[0]))?;
    }

    loop {
        for mac in &cli.mac {
            if let Err(e) = read_out(mac, cli.model).await {
                eprintln!("{mac}: {e:#}");
            }
        }
        if cli.interval == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_secs(cli.interval)).await;
    }
    Ok(())
}

async fn read_out(mac: &str, model: Model) -> anyhow::Result<()> {
    let mut sensor = SensorClient::new(model, mac)?;
    println!("Fetching data from {mac}");
    let data = sensor.data().await?;
    println!("Temperature: {:.2} °C", data.temperature);
    println!("Humidity: {} %", data.humidity);
    let battery = match data.battery {
        Some(battery) => battery,
        None => sensor.battery().await?,
    };
    println!("Battery: {battery:.1} %");
    println!();
    Ok(())
}

async fn export_history(mac: &str, model: Model, path: &Path) -> anyhow::Result<()> {
    let mut sensor = SensorClient::new(model, mac)?;
    println!("Fetching history from {mac} (this is slow)");
    let records = sensor.history().await?;

    let mut file = File::create(path)?;
    writeln!(
        file,
        "Time,Min temperature,Min humidity,Max temperature,Max humidity"
    )?;
    for record in &records {
        writeln!(
            file,
            "{},{},{},{},{}",
            record.time.format("%Y-%m-%d %H:%M:%S"),
            record.min_temperature,
            record.min_humidity,
            record.max_temperature,
            record.max_humidity,
        )?;
    }
    println!("Wrote {} records to {}", records.len(), path.display());
    Ok(())
}
