use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;

use tcd1304_rs::logging::init_rust_logging;
use tcd1304_rs::{
    transport, Acquisition, AcquisitionConfig, AcquisitionEvent, Firmware, Mode, PortSettings,
    Progress, SessionOutcome, Spectrometer, DEFAULT_BAUD_RATE, PROGRESS_TICKS,
};

#[derive(Parser, Debug)]
#[command(name = "tcd1304", about = "Acquire spectra from a TCD1304 linear CCD")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    List,
    /// Check that a serial port can be opened
    Probe(PortArgs),
    /// Acquire one (averaged) spectrum and write it as CSV
    Collect {
        #[command(flatten)]
        acq: AcqArgs,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Stream continuous spectra and print a summary line per frame
    Stream {
        #[command(flatten)]
        acq: AcqArgs,
        /// Number of frames to receive before stopping
        #[arg(short = 'n', long, default_value_t = 10)]
        frames: usize,
    },
}

#[derive(Args, Debug)]
struct PortArgs {
    /// Serial port name (e.g. /dev/ttyACM0, COM5)
    #[arg(short, long)]
    port: String,
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
}

#[derive(Args, Debug)]
struct AcqArgs {
    #[command(flatten)]
    port: PortArgs,
    /// TOML file with acquisition settings; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = FirmwareArg::Stm32f401)]
    firmware: FirmwareArg,
    /// SH period in clock ticks
    #[arg(long)]
    sh: Option<u32>,
    /// ICG period in clock ticks
    #[arg(long)]
    icg: Option<u32>,
    /// Exposure time in microseconds (derives SH and ICG)
    #[arg(long, conflicts_with_all = ["sh", "icg"])]
    exposure_us: Option<u64>,
    /// Number of exposures to average (1-255)
    #[arg(short, long)]
    average: Option<u8>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FirmwareArg {
    Stm32f401,
    Stm32f103,
}

impl From<FirmwareArg> for Firmware {
    fn from(arg: FirmwareArg) -> Self {
        match arg {
            FirmwareArg::Stm32f401 => Firmware::Stm32F401,
            FirmwareArg::Stm32f103 => Firmware::Stm32F103,
        }
    }
}

impl PortArgs {
    fn settings(&self) -> PortSettings {
        PortSettings::new(&self.port).with_baud_rate(self.baud)
    }
}

impl AcqArgs {
    fn acquisition_config(&self, mode: Mode) -> Result<AcquisitionConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                toml::from_str::<AcquisitionConfig>(&text)
                    .with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => AcquisitionConfig::for_firmware(self.firmware.into()),
        };

        if let Some(sh) = self.sh {
            config.sh_period = sh;
        }
        if let Some(icg) = self.icg {
            config.icg_period = icg;
        }
        if let Some(us) = self.exposure_us {
            config = config.with_exposure(Duration::from_micros(us));
        }
        if let Some(average) = self.average {
            config.requested_average = average;
        }
        Ok(config.with_mode(mode))
    }
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Command::List => list_ports(),
        Command::Probe(port) => probe(port),
        Command::Collect { acq, output } => collect(acq, output.as_ref()),
        Command::Stream { acq, frames } => stream(acq, *frames),
    }
}

fn list_ports() -> Result<()> {
    let ports = transport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for name in ports {
        println!("{name}");
    }
    Ok(())
}

fn probe(port: &PortArgs) -> Result<()> {
    transport::probe(&port.settings())?;
    println!("{}: device present", port.port);
    Ok(())
}

fn collect(args: &AcqArgs, output: Option<&PathBuf>) -> Result<()> {
    let config = args.acquisition_config(Mode::OneShot)?;
    info!(
        "integration time {:?}, average {}",
        config.integration_time(),
        config.requested_average
    );

    let ccd = Spectrometer::new(args.port.settings());
    let handle = ccd.acquire(config)?;

    while !handle.is_finished() {
        if let Some(AcquisitionEvent::Progress(Progress::Tick(t))) =
            handle.next_event(Duration::from_millis(100))
        {
            eprint!(
                "\r[{:<width$}]",
                "#".repeat(t as usize),
                width = PROGRESS_TICKS as usize
            );
        }
    }
    eprintln!();

    match handle.wait()? {
        SessionOutcome::Completed(acq) => {
            let csv = spectrum_to_csv(&acq);
            match output {
                Some(path) => File::create(path)
                    .and_then(|mut f| f.write_all(csv.as_bytes()))
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => io::stdout().write_all(csv.as_bytes())?,
            }
        }
        SessionOutcome::Cancelled => eprintln!("Acquisition cancelled"),
    }
    Ok(())
}

fn stream(args: &AcqArgs, frames: usize) -> Result<()> {
    let config = args.acquisition_config(Mode::Continuous)?;
    let ccd = Spectrometer::new(args.port.settings());
    let handle = ccd.acquire(config)?;

    let mut received = 0usize;
    while received < frames && !handle.is_finished() {
        if let Some(AcquisitionEvent::Frame(acq)) = handle.next_event(Duration::from_millis(500)) {
            received += 1;
            let (min, max, mean) = summarize(&acq);
            println!(
                "frame {received}: min={min} max={max} mean={mean:.1} (SH={}, ICG={})",
                acq.sent.sh_period, acq.sent.icg_period
            );
        }
    }

    handle.cancel();
    handle.wait()?;
    Ok(())
}

fn spectrum_to_csv(acq: &Acquisition) -> String {
    let mut out = format!(
        "# sh_period={} icg_period={} hardware_average={} software_iterations={}\npixel,value\n",
        acq.sent.sh_period,
        acq.sent.icg_period,
        acq.plan.hardware_average,
        acq.plan.software_iterations
    );
    for (pixel, value) in acq.samples.iter().enumerate() {
        out.push_str(&format!("{},{}\n", pixel + 1, value));
    }
    out
}

fn summarize(acq: &Acquisition) -> (u16, u16, f64) {
    let min = acq.samples.iter().copied().min().unwrap_or(0);
    let max = acq.samples.iter().copied().max().unwrap_or(0);
    let mean = if acq.samples.is_empty() {
        0.0
    } else {
        acq.samples.iter().map(|&s| s as f64).sum::<f64>() / acq.samples.len() as f64
    };
    (min, max, mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcd1304_rs::{plan_averaging, SampleBuffer, SentTiming, PIXEL_COUNT};

    fn acquisition(value: u16) -> Acquisition {
        Acquisition {
            samples: SampleBuffer::try_from(vec![value; PIXEL_COUNT]).unwrap(),
            sent: SentTiming {
                sh_period: 200,
                icg_period: 100_000,
            },
            plan: plan_averaging(40),
            mode: Mode::OneShot,
        }
    }

    #[test]
    fn csv_has_header_and_one_line_per_pixel() {
        let csv = spectrum_to_csv(&acquisition(1000));
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "# sh_period=200 icg_period=100000 hardware_average=15 software_iterations=3"
        );
        assert_eq!(lines[1], "pixel,value");
        assert_eq!(lines[2], "1,1000");
        assert_eq!(lines.len(), PIXEL_COUNT + 2);
    }

    #[test]
    fn summary_of_flat_frame() {
        assert_eq!(summarize(&acquisition(7)), (7, 7, 7.0));
    }

    #[test]
    fn flags_override_firmware_defaults() {
        let cli = Cli::parse_from([
            "tcd1304", "collect", "--port", "COM5", "--firmware", "stm32f103", "--sh", "100",
            "--icg", "15000", "-a", "20",
        ]);
        let Command::Collect { acq, .. } = cli.command else {
            panic!("expected collect");
        };
        let config = acq.acquisition_config(Mode::OneShot).unwrap();
        assert_eq!(config.clock_hz, 800_000);
        assert_eq!(config.sh_period, 100);
        assert_eq!(config.icg_period, 15_000);
        assert_eq!(config.requested_average, 20);
    }
}
