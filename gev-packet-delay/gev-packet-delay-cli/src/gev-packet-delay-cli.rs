#[cfg(feature = "backend_sim")]
extern crate gev_packet_delay_sim as backend;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tabled::{Table, Tabled};
use tracing::info;

use gev_packet_delay::{
    feature, wait_feature_writable, CameraInfo, CameraModule, DelayCamera, FrameBufferPool,
    PacketDelaySearch, SearchOutcome, DEFAULT_NUM_BUFFERS,
};
use machine_vision_formats::PixFmt;

/// How long to wait for PixelFormat to become writable before a run.
const FORMAT_WRITABLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
struct Tune {
    /// tune only this pixel format (default: all supported formats)
    #[arg(short, long)]
    pixel_format: Option<String>,

    /// number of grab buffers used for each rate measurement
    #[arg(long, default_value_t = DEFAULT_NUM_BUFFERS)]
    num_buffers: usize,

    /// specify the name of the camera to use
    #[arg(short, long)]
    camera_name: Option<String>,
}

/// inter-packet delay utilities for GigE Vision cameras
#[derive(Debug, Parser)]
#[command(name = "gev-packet-delay", author, version)]
enum Command {
    /// find the largest inter-packet delay which preserves the frame rate
    Tune(Tune),

    /// list the camera's supported pixel formats
    Formats {
        /// specify the name of the camera to use
        #[arg(short, long)]
        camera_name: Option<String>,
    },

    /// list cameras
    List,
}

#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "Pixel format")]
    pixel_format: String,
    #[tabled(rename = "Delay (ticks)")]
    delay_ticks: String,
    #[tabled(rename = "Delay (usec)")]
    delay_usec: String,
    #[tabled(rename = "Reference (fps)")]
    reference_fps: String,
    #[tabled(rename = "Obtained (fps)")]
    obtained_fps: String,
    #[tabled(rename = "Status")]
    status: String,
}

fn unresolved_row(pixfmt: PixFmt, status: String) -> ReportRow {
    ReportRow {
        pixel_format: format!("{pixfmt}"),
        delay_ticks: "-".to_string(),
        delay_usec: "-".to_string(),
        reference_fps: "-".to_string(),
        obtained_fps: "-".to_string(),
        status,
    }
}

fn report_row(pixfmt: PixFmt, outcome: &SearchOutcome) -> ReportRow {
    match outcome {
        SearchOutcome::Converged(result) => ReportRow {
            pixel_format: format!("{pixfmt}"),
            delay_ticks: result.delay_ticks.to_string(),
            delay_usec: format!("{:.3}", result.delay_seconds * 1e6),
            reference_fps: format!("{:.1}", result.base_frame_rate),
            obtained_fps: format!("{:.1}", result.measured_frame_rate),
            status: "ok".to_string(),
        },
        SearchOutcome::StoppedAtNonPositiveDelay(result) => ReportRow {
            pixel_format: format!("{pixfmt}"),
            delay_ticks: result.delay_ticks.to_string(),
            delay_usec: format!("{:.3}", result.delay_seconds * 1e6),
            reference_fps: format!("{:.1}", result.base_frame_rate),
            obtained_fps: format!("{:.1}", result.measured_frame_rate),
            status: "stopped at non-positive delay".to_string(),
        },
        SearchOutcome::ConvergedAtZero => {
            unresolved_row(pixfmt, "no usable delay (converged at zero)".to_string())
        }
        SearchOutcome::DrivenToZero => {
            unresolved_row(pixfmt, "no usable delay (driven to zero)".to_string())
        }
        SearchOutcome::DidNotConverge { iterations } => unresolved_row(
            pixfmt,
            format!("did not converge after {iterations} iterations"),
        ),
    }
}

fn resolve_camera_name(
    mymod: &backend::WrappedModule,
    camera_name: Option<String>,
) -> anyhow::Result<String> {
    if let Some(camera_name) = camera_name {
        return Ok(camera_name);
    }
    let infos = mymod.camera_infos()?;
    if infos.is_empty() {
        anyhow::bail!("no cameras detected");
    }
    Ok(infos[0].name().to_string())
}

fn list(mymod: &backend::WrappedModule) -> anyhow::Result<()> {
    for info in mymod.camera_infos()?.iter() {
        println!("{}", info.name());
    }
    Ok(())
}

fn formats(mymod: &mut backend::WrappedModule, camera_name: Option<String>) -> anyhow::Result<()> {
    let name = resolve_camera_name(mymod, camera_name)?;
    let cam = mymod.camera(&name)?;
    for pixfmt in cam.possible_pixel_formats()? {
        println!("{pixfmt}");
    }
    Ok(())
}

fn tune(mymod: &mut backend::WrappedModule, args: Tune) -> anyhow::Result<()> {
    let name = resolve_camera_name(mymod, args.camera_name.clone())?;
    let mut cam = mymod.camera(&name)?;
    info!("opened camera {name}");

    let all_formats = cam.possible_pixel_formats()?;
    let selected = match &args.pixel_format {
        Some(wanted) => {
            let pixfmt = all_formats
                .iter()
                .copied()
                .find(|pixfmt| format!("{pixfmt}") == *wanted)
                .with_context(|| {
                    format!("pixel format {wanted} is not supported by {name} (see `formats`)")
                })?;
            vec![pixfmt]
        }
        None => all_formats,
    };

    let mut rows = Vec::with_capacity(selected.len());
    for pixfmt in selected {
        wait_feature_writable(&cam, feature::PIXEL_FORMAT, FORMAT_WRITABLE_TIMEOUT)?;
        cam.set_pixel_format(pixfmt)?;
        let mut buffers = FrameBufferPool::for_camera(&cam, args.num_buffers)?;

        println!("Calculating inter-packet delay for {pixfmt}.");
        let search = PacketDelaySearch::new(&mut cam, &mut buffers)?;
        let outcome = search.run()?;
        rows.push(report_row(pixfmt, &outcome));
    }

    // Leave the camera with no inter-packet delay programmed.
    cam.set_inter_packet_delay(0)?;

    print_report(&cam, &rows)?;
    Ok(())
}

fn print_report<C: DelayCamera>(cam: &C, rows: &[ReportRow]) -> anyhow::Result<()> {
    println!();
    println!(
        "Inter-packet delay report summary for {} {}:",
        cam.vendor(),
        cam.model()
    );
    println!();
    println!("Camera parameters:");
    println!("  SizeX:       {}", cam.width()?);
    println!("  SizeY:       {}", cam.height()?);
    println!("  Packet size: {}", cam.packet_size()?);
    println!();
    println!("{}", Table::new(rows));
    println!();
    println!("Printed inter-packet delay results are valid only for the above parameters.");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("gev_packet_delay=info,warn"),
    )
    .init();

    let opt = Command::parse();

    let mut mymod = backend::new_module()?;

    match opt {
        Command::Tune(args) => tune(&mut mymod, args)?,
        Command::Formats { camera_name } => formats(&mut mymod, camera_name)?,
        Command::List => list(&mymod)?,
    };

    Ok(())
}
