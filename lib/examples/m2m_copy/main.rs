//! Streams generated frames through an in-process privcam device and
//! optionally saves what comes out of the CAPTURE queue.
//!
//! OUTPUT buffers are either device-allocated (`mmap`) or imported from
//! buffers exported by another session of the same device (`dmabuf`).
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::ensure;
use clap::{App, Arg};
use nix::sys::time::{TimeVal, TimeValLike};
use privcam::device::queue::qbuf::QBuffer;
use privcam::device::{Device, DeviceConfig, JobSlots, SessionConfig};
use privcam::memory::{DmaBufHandle, MemoryType, PlaneMapping};
use privcam::{Format, PixelFormat, QueueDirection};
use privcam_utils::dmabuf_exporter::export_dmabufs;
use privcam_utils::framegen::FrameGenerator;

const NUM_BUFFERS: usize = 2;

fn main() {
    env_logger::init();

    let matches = App::new("privcam m2m copy")
        .arg(
            Arg::with_name("num_frames")
                .long("stop_after")
                .takes_value(true)
                .help("Stop after copying a given number of frames"),
        )
        .arg(
            Arg::with_name("frame_size")
                .long("frame_size")
                .required(false)
                .takes_value(true)
                .default_value("640x480")
                .help("Size of the frames to copy (e.g. \"640x480\")"),
        )
        .arg(
            Arg::with_name("pixelformat")
                .long("pixelformat")
                .required(false)
                .takes_value(true)
                .default_value("YUYV")
                .help("Pixel format of the device (YUYV or YM12)"),
        )
        .arg(
            Arg::with_name("output_mem")
                .long("output_mem")
                .required(false)
                .takes_value(true)
                .default_value("mmap")
                .help("Type of memory to use for the OUTPUT queue (mmap or dmabuf)"),
        )
        .arg(
            Arg::with_name("per_session_slots")
                .long("per_session_slots")
                .help("Let jobs of different sessions run concurrently"),
        )
        .arg(
            Arg::with_name("output_file")
                .long("save")
                .required(false)
                .takes_value(true)
                .help("Save the copied frames to a file"),
        )
        .get_matches();

    let mut stop_after = match clap::value_t!(matches.value_of("num_frames"), usize) {
        Ok(v) => Some(v),
        Err(e) if e.kind == clap::ErrorKind::ArgumentNotFound => None,
        Err(e) => panic!("Invalid value for stop_after: {}", e),
    };

    let frame_size = matches
        .value_of("frame_size")
        .map(|s| {
            const ERROR_MSG: &str = "Invalid parameter for frame_size";
            let split: Vec<&str> = s.split('x').collect();
            if split.len() != 2 {
                panic!("{}", ERROR_MSG);
            }
            let width: usize = split[0].parse().expect(ERROR_MSG);
            let height: usize = split[1].parse().expect(ERROR_MSG);

            (width, height)
        })
        .unwrap();

    let pixelformat = match matches.value_of("pixelformat") {
        Some(s) if s.len() == 4 => PixelFormat::from_fourcc(
            s.as_bytes()
                .try_into()
                .expect("Invalid value for pixelformat"),
        ),
        _ => panic!("Invalid value for pixelformat"),
    };

    let output_mem = match matches.value_of("output_mem") {
        Some("mmap") => MemoryType::Mmap,
        Some("dmabuf") => MemoryType::DmaBuf,
        _ => panic!("Invalid value for output_mem"),
    };

    let job_slots = if matches.is_present("per_session_slots") {
        JobSlots::PerSession
    } else {
        JobSlots::Shared
    };

    let mut output_file = matches
        .value_of("output_file")
        .map(|s| File::create(s).expect("Invalid output file specified."));

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set Ctrl-C handler.");
    }

    let device = Device::new(
        DeviceConfig::new()
            .pixelformat(pixelformat)
            .job_slots(job_slots),
    )
    .expect("Failed to create device");
    let session = device.open_session(SessionConfig::new());
    println!("Opened device: {:?}", session.query_capability());

    let format = set_formats(&session, pixelformat, frame_size).expect("Failed to set formats");
    println!(
        "Configured device for {}x{} ({} planes)",
        format.width,
        format.height,
        format.num_planes()
    );

    let mut frame_gen = FrameGenerator::new(&format).expect("Failed to create frame generator");

    // Imported OUTPUT memory comes from a scratch session of the same device.
    let mut dmabufs: VecDeque<Vec<DmaBufHandle>> = match output_mem {
        MemoryType::Mmap => VecDeque::new(),
        MemoryType::DmaBuf => export_dmabufs(&device, QueueDirection::Output, &format, NUM_BUFFERS)
            .expect("Failed to export DMABufs")
            .into_iter()
            .collect(),
    };

    session
        .request_buffers(QueueDirection::Output, output_mem, NUM_BUFFERS)
        .expect("Failed to allocate OUTPUT buffers");
    session
        .request_buffers(QueueDirection::Capture, MemoryType::Mmap, NUM_BUFFERS)
        .expect("Failed to allocate CAPTURE buffers");
    for direction in [QueueDirection::Output, QueueDirection::Capture] {
        session
            .stream_on(direction)
            .expect("Failed to start streaming");
    }

    let mut free_outputs: VecDeque<usize> = (0..NUM_BUFFERS).collect();
    for index in 0..NUM_BUFFERS {
        session
            .queue_buffer(QBuffer::new(QueueDirection::Capture, index))
            .expect("Failed to queue capture buffer");
    }

    let start_time = Instant::now();
    let mut total_size = 0usize;
    let mut frame_counter = 0usize;

    while !lets_quit.load(Ordering::SeqCst) {
        if let Some(max_cpt) = &mut stop_after {
            if *max_cpt == 0 {
                break;
            }
            *max_cpt -= 1;
        }

        if free_outputs.is_empty() {
            let mut dqbuf = session
                .dequeue_buffer(QueueDirection::Output)
                .expect("Failed to dequeue output buffer");
            if let Some(handles) = dqbuf.take_handles().filter(|h| !h.is_empty()) {
                dmabufs.push_back(handles);
            }
            free_outputs.push_back(dqbuf.index);
        }
        let index = free_outputs
            .pop_front()
            .expect("No free output buffer");

        let timestamp = TimeVal::microseconds(start_time.elapsed().as_micros() as i64);
        let qbuf = QBuffer::new(QueueDirection::Output, index).set_timestamp(timestamp);
        let qbuf = match output_mem {
            MemoryType::Mmap => {
                let mut planes = (0..format.num_planes())
                    .map(|plane| session.map_plane(QueueDirection::Output, index, plane))
                    .collect::<Result<Vec<_>, _>>()
                    .expect("Failed to get MMAP mapping");
                frame_gen
                    .next_frame(&mut planes)
                    .expect("Failed to generate frame");
                qbuf
            }
            MemoryType::DmaBuf => {
                let handles = dmabufs.pop_front().expect("No backing dmabuf to bind");
                let mut planes = handles
                    .iter()
                    .map(|h| h.map().unwrap().expect("Empty DMABuf"))
                    .collect::<Vec<PlaneMapping>>();
                frame_gen
                    .next_frame(&mut planes)
                    .expect("Failed to generate frame");
                qbuf.set_handles(handles)
            }
        };
        session
            .queue_buffer(qbuf)
            .map_err(|e| e.error)
            .expect("Failed to queue input frame");

        let cap_dqbuf = session
            .dequeue_buffer(QueueDirection::Capture)
            .expect("Failed to dequeue capture buffer");
        if cap_dqbuf.is_error() {
            eprintln!("\nFrame {} failed", cap_dqbuf.sequence);
        }
        let bytes_used: usize = cap_dqbuf.bytes_used.iter().sum();
        total_size = total_size.wrapping_add(bytes_used);
        frame_counter += 1;
        let fps = frame_counter as f32 / start_time.elapsed().as_millis().max(1) as f32 * 1000.0;
        print!(
            "\rCopied frame {:#5}, index: {:#2}, bytes used:{:#8} total size:{:#10} fps: {:#7.2}",
            cap_dqbuf.sequence, cap_dqbuf.index, bytes_used, total_size, fps,
        );
        io::stdout().flush().unwrap();

        if let Some(ref mut output) = output_file {
            for (plane, &plane_bytes) in cap_dqbuf.bytes_used.iter().enumerate() {
                let mapping = session
                    .map_plane(QueueDirection::Capture, cap_dqbuf.index, plane)
                    .expect("Failed to map capture buffer")
                    .restrict(0, plane_bytes);
                output
                    .write_all(mapping.as_ref())
                    .expect("Error while writing output data");
            }
        }

        session
            .queue_buffer(QBuffer::new(QueueDirection::Capture, cap_dqbuf.index))
            .map_err(|e| e.error)
            .expect("Failed to requeue capture buffer");
    }

    for direction in [QueueDirection::Output, QueueDirection::Capture] {
        session.stream_off(direction);
    }

    // Insert new line since we were overwriting the same one
    println!();
}

fn set_formats(
    session: &privcam::device::Session,
    pixelformat: PixelFormat,
    frame_size: (usize, usize),
) -> anyhow::Result<Format> {
    let requested = Format::from((pixelformat, frame_size));
    let output = session.set_format(QueueDirection::Output, requested.clone())?;
    let capture = session.set_format(QueueDirection::Capture, requested)?;

    ensure!(
        output.width as usize == frame_size.0 && output.height as usize == frame_size.1,
        "Frame resolution not supported, adjusted to {}x{}",
        output.width,
        output.height
    );
    ensure!(*output == *capture, "OUTPUT and CAPTURE formats differ");

    Ok((*output).clone())
}
