//! End-to-end tests: a fake capture service answers the control channel on
//! a socketpair while a testkit ring writer plays the producer.
#![cfg(unix)]

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use frametap::control::{read_request, write_response, AdapterInfo, DeviceVendor, Request, Response, Status};
use frametap::testkit::{displayed_record, RingWriter};
use frametap::{Error, Metric, Middleware, PresentMode, QueryElement, Stat};

fn spawn_service(ring_path: PathBuf) -> (UnixStream, JoinHandle<()>) {
    let (client, mut server) = UnixStream::pair().unwrap();
    let handle = std::thread::spawn(move || loop {
        let request = match read_request(&mut server) {
            Ok(r) => r,
            Err(_) => break,
        };
        let response = match request {
            Request::EnumerateAdapters => Response::EnumerateAdapters {
                status: Status::Success,
                adapters: vec![AdapterInfo {
                    id: 1,
                    vendor: DeviceVendor::Intel,
                    name: "Arc A770".into(),
                    gpu_sustained_power_limit: 225.0,
                    gpu_memory_size: 16 << 30,
                    gpu_memory_max_bandwidth: 560_000_000_000,
                }],
            },
            Request::GetStaticCpuMetrics => Response::StaticCpuMetrics {
                status: Status::Success,
                cpu_name: "Intel Core i9-14900K".into(),
                cpu_power_limit: 125.0,
            },
            Request::StartStream { .. } => Response::StartStream {
                status: Status::Success,
                ring_path: ring_path.to_string_lossy().into_owned(),
            },
            Request::StopStream { .. } => Response::StopStream {
                status: Status::Success,
            },
            Request::SelectAdapter { .. } => Response::SelectAdapter {
                status: Status::Success,
            },
            Request::SetTelemetryPeriod { .. } => Response::SetTelemetryPeriod {
                status: Status::Success,
            },
        };
        if write_response(&mut server, &response).is_err() {
            break;
        }
    });
    (client, handle)
}

fn connect(ring_path: &Path) -> (Middleware, JoinHandle<()>) {
    let (transport, handle) = spawn_service(ring_path.to_path_buf());
    let mw = Middleware::over_transport(Box::new(transport)).unwrap();
    (mw, handle)
}

fn read_f64(blob: &[u8], offset: usize) -> f64 {
    f64::from_ne_bytes(blob[offset..offset + 8].try_into().unwrap())
}

fn read_u64(blob: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(blob[offset..offset + 8].try_into().unwrap())
}

fn read_u32(blob: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(blob[offset..offset + 4].try_into().unwrap())
}

fn read_str(blob: &[u8], offset: usize) -> &str {
    let slice = &blob[offset..];
    let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    std::str::from_utf8(&slice[..end]).unwrap()
}

#[test]
fn dynamic_poll_aggregates_frames_and_telemetry() {
    let dir = tempfile::tempdir().unwrap();
    let ring_path = dir.path().join("ring-42");
    // One tick per millisecond.
    let mut writer = RingWriter::create(&ring_path, 64, 1000).unwrap();
    // Burn-in so the first cadence record has a predecessor.
    let mut burn = displayed_record(0xbeef, 500, 1);
    burn.frame_id = 1;
    writer.push(&burn);
    for k in 0..7u64 {
        // Presents every 6 ms with 1 ms in present: 1000/6 fps.
        let mut r = displayed_record(0xbeef, 1_000 + 6 * k, 1);
        r.frame_id = k as u32 + 2;
        r.power.gpu_power_w = 42.0;
        writer.push(&r);
    }

    let (mut mw, service) = connect(&ring_path);
    assert_eq!(mw.devices().len(), 1);
    assert_eq!(mw.cpu_info().unwrap().vendor, DeviceVendor::Intel);

    mw.start_streaming(42).unwrap();

    let mut elements = vec![
        QueryElement::new(Metric::PresentedFps, Stat::Avg),
        QueryElement::new(Metric::GpuPower, Stat::Avg).with_device(1),
        QueryElement::new(Metric::Application, Stat::Avg),
        QueryElement::new(Metric::GpuName, Stat::Avg).with_device(1),
    ];
    let query = mw.register_dynamic_query(&mut elements, 10_000.0, 0.0).unwrap();
    let blob_size = elements.last().map(|e| e.data_offset + e.data_size).unwrap();

    let mut blob = vec![0u8; blob_size];
    let mut num_swap_chains = 4u32;
    mw.poll_dynamic_query(query, 42, &mut blob, &mut num_swap_chains)
        .unwrap();

    assert!((read_f64(&blob, elements[0].data_offset) - 1000.0 / 6.0).abs() < 1e-6);
    assert_eq!(read_f64(&blob, elements[1].data_offset), 42.0);
    assert_eq!(read_str(&blob, elements[2].data_offset), "app.exe");
    assert_eq!(read_str(&blob, elements[3].data_offset), "Arc A770");

    // Static metrics are also served on their own.
    let element = QueryElement::new(Metric::CpuName, Stat::Avg);
    let mut static_blob = vec![0u8; 260];
    mw.poll_static_query(&element, 42, &mut static_blob).unwrap();
    assert_eq!(read_str(&static_blob, 0), "Intel Core i9-14900K");

    mw.stop_streaming(42).unwrap();
    drop(mw);
    service.join().unwrap();
}

#[test]
fn frame_rows_carry_typed_values_at_registered_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let ring_path = dir.path().join("ring-43");
    let mut writer = RingWriter::create(&ring_path, 64, 1_000_000).unwrap();

    let mut r0 = displayed_record(0xbeef, 10, 5);
    r0.frame_id = 1;
    writer.push(&r0);

    // The row under test: its CPU start is r1's present stop (100 + 23).
    let mut r1 = displayed_record(0xbeef, 100, 23);
    r1.frame_id = 2;
    writer.push(&r1);

    let mut r2 = displayed_record(0xbeef, 1_000, 50);
    r2.frame_id = 3;
    r2.power.gpu_power_w = 42.0;
    r2.present_mode = PresentMode::HardwareIndependentFlip as u32;
    writer.push(&r2);

    let mut r3 = displayed_record(0xbeef, 2_000, 50);
    r3.frame_id = 4;
    writer.push(&r3);

    let (mut mw, service) = connect(&ring_path);
    mw.start_streaming(43).unwrap();

    let mut elements = vec![
        QueryElement::new(Metric::GpuPower, Stat::Avg),
        QueryElement::new(Metric::PresentMode, Stat::Avg),
        QueryElement::new(Metric::CpuStartQpc, Stat::Avg),
    ];
    let (query, stride) = mw.register_frame_query(&mut elements).unwrap();
    assert_eq!(stride, 20);

    let mut blob = vec![0u8; stride * 8];
    let mut num_frames = 8u32;
    mw.consume_frame_events(query, 43, &mut blob, &mut num_frames)
        .unwrap();
    // Rows for r1 and r2; r3 still waits for a displayed successor.
    assert_eq!(num_frames, 2);

    let row = &blob[stride..2 * stride];
    assert_eq!(read_f64(row, elements[0].data_offset), 42.0);
    assert_eq!(
        read_u32(row, elements[1].data_offset),
        PresentMode::HardwareIndependentFlip as u32
    );
    assert_eq!(read_u64(row, elements[2].data_offset), 123);

    // Consuming again yields nothing new until the producer advances.
    let mut num_frames = 8u32;
    mw.consume_frame_events(query, 43, &mut blob, &mut num_frames)
        .unwrap();
    assert_eq!(num_frames, 0);

    drop(mw);
    service.join().unwrap();
}

#[test]
fn process_death_stops_the_stream_and_fails_frame_consumption() {
    let dir = tempfile::tempdir().unwrap();
    let ring_path = dir.path().join("ring-44");
    let mut writer = RingWriter::create(&ring_path, 64, 1000).unwrap();
    writer.push(&displayed_record(0xbeef, 1_000, 1));

    let (mut mw, service) = connect(&ring_path);
    mw.start_streaming(44).unwrap();

    let mut elements = vec![QueryElement::new(Metric::CpuBusy, Stat::Avg)];
    let (query, stride) = mw.register_frame_query(&mut elements).unwrap();

    writer.set_process_active(false);

    // The dynamic surface returns silently on a dead process.
    let mut dyn_elements = vec![QueryElement::new(Metric::PresentedFps, Stat::Avg)];
    let dyn_query = mw
        .register_dynamic_query(&mut dyn_elements, 1_000.0, 0.0)
        .unwrap();
    let mut dyn_blob = vec![0u8; 8];
    let mut chains = 1u32;
    mw.poll_dynamic_query(dyn_query, 44, &mut dyn_blob, &mut chains)
        .unwrap();

    // The frame surface stops the stream, then fails.
    let mut blob = vec![0u8; stride * 4];
    let mut num_frames = 4u32;
    let err = mw
        .consume_frame_events(query, 44, &mut blob, &mut num_frames)
        .unwrap_err();
    assert!(matches!(err, Error::ProcessGone));
    assert_eq!(num_frames, 0);

    // The stream client is gone; another consume reports that.
    let mut num_frames = 4u32;
    let err = mw
        .consume_frame_events(query, 44, &mut blob, &mut num_frames)
        .unwrap_err();
    assert!(matches!(err, Error::StreamNotFound(44)));

    drop(mw);
    service.join().unwrap();
}
