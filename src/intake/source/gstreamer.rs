use async_trait::async_trait;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer::{ClockTime, MessageView};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use std::time::Duration;

use super::{CameraKind, CaptureBackend, ImageControls, SourceSpec};
use crate::error::CameraError;

const SINK_NAME: &str = "sink";
// Upper bound for a single appsink pull; the camera applies the configured read timeout on top.
const PULL_TIMEOUT: Duration = Duration::from_secs(5);

/// Hardware capture through a GStreamer pipeline ending in an RGB `appsink`.
pub struct GStreamerBackend {
    running: Option<Running>,
}

struct Running {
    device: String,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

impl GStreamerBackend {
    pub fn new() -> Self {
        Self { running: None }
    }
}

impl Default for GStreamerBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// `gst-launch` description for the given source.
pub fn pipeline_description(spec: &SourceSpec) -> String {
    let (width, height, fps) = (spec.width, spec.height, spec.fps);
    let head = match spec.kind {
        CameraKind::Usb => format!(
            "v4l2src device=/dev/video{}{} ! video/x-raw,width={width},height={height},framerate={fps}/1,format=YUY2",
            spec.device,
            v4l2_controls(&spec.controls)
        ),
        CameraKind::Csi => format!(
            "nvarguscamerasrc sensor-id={}{} ! video/x-raw(memory:NVMM),width={width},height={height},format=NV12,framerate={fps}/1 ! nvvidconv flip-method=0 ! video/x-raw,format=BGRx",
            spec.device,
            argus_controls(&spec.controls)
        ),
        CameraKind::Ip => format!(
            "rtspsrc location={} latency=200 ! rtph264depay ! h264parse ! avdec_h264 ! videoscale",
            spec.device
        ),
    };
    format!(
        "{head} ! videoconvert ! video/x-raw,format=RGB,width={width},height={height} ! appsink name={SINK_NAME} max-buffers=1 drop=true sync=false"
    )
}

fn v4l2_controls(controls: &ImageControls) -> String {
    let mut fields = Vec::new();
    if let Some(brightness) = controls.brightness {
        fields.push(format!("brightness={}", (brightness * 64.0).round() as i32));
    }
    if let Some(exposure_us) = controls.exposure_us {
        // V4L2 exposure_absolute is in 100 us units.
        fields.push("exposure_auto=1".to_string());
        fields.push(format!("exposure_absolute={}", (exposure_us / 100).max(1)));
    }
    if let Some(kelvin) = controls.white_balance_k {
        fields.push("white_balance_temperature_auto=0".to_string());
        fields.push(format!("white_balance_temperature={kelvin}"));
    }
    if fields.is_empty() {
        String::new()
    } else {
        format!(" extra-controls=\"c,{}\"", fields.join(","))
    }
}

fn argus_controls(controls: &ImageControls) -> String {
    let mut props = String::new();
    if let Some(exposure_us) = controls.exposure_us {
        let ns = exposure_us as u64 * 1_000;
        props.push_str(&format!(" exposuretimerange=\"{ns} {ns}\""));
    }
    if let Some(brightness) = controls.brightness {
        props.push_str(&format!(" exposurecompensation={:.2}", brightness * 2.0));
    }
    props
}

fn unavailable(device: &str, message: impl Into<String>) -> CameraError {
    CameraError::unavailable(device, message)
}

fn drain_bus_errors(device: &str, bus: &gst::Bus) -> Result<(), CameraError> {
    while let Some(msg) = bus.timed_pop_filtered(ClockTime::from_mseconds(0), &[gst::MessageType::Error]) {
        if let MessageView::Error(err) = msg.view() {
            return Err(unavailable(device, err.error().to_string()));
        }
    }
    Ok(())
}

fn image_from_sample(device: &str, sample: &gst::Sample) -> Result<RgbImage, CameraError> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| unavailable(device, "appsink sample missing buffer"))?;
    let caps = sample
        .caps()
        .ok_or_else(|| unavailable(device, "appsink sample missing caps"))?;
    let info = gst_video::VideoInfo::from_caps(caps).map_err(|err| unavailable(device, err.to_string()))?;
    let map = buffer
        .map_readable()
        .map_err(|err| unavailable(device, err.to_string()))?;

    let width = info.width();
    let height = info.height();
    let stride = info.stride()[0] as usize;
    let row_bytes = width as usize * 3;
    let data = map.as_slice();
    if stride < row_bytes || data.len() < stride * height as usize {
        return Err(unavailable(
            device,
            format!("incomplete RGB frame: have {} bytes for {width}x{height}", data.len()),
        ));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in data.chunks(stride).take(height as usize) {
        pixels.extend_from_slice(&row[..row_bytes]);
    }
    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| unavailable(device, "frame buffer does not match its caps"))
}

#[async_trait]
impl CaptureBackend for GStreamerBackend {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    async fn open(&mut self, spec: &SourceSpec) -> Result<(), CameraError> {
        let device = spec.device_key();
        gst::init().map_err(|err| unavailable(&device, err.to_string()))?;

        let description = pipeline_description(spec);
        tracing::info!(device = %device, pipeline = %description, "Launching GStreamer pipeline");

        let pipeline = gst::parse_launch(&description)
            .map_err(|err| unavailable(&device, format!("invalid pipeline: {err}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| unavailable(&device, "launch description is not a pipeline"))?;
        let appsink = pipeline
            .by_name(SINK_NAME)
            .and_then(|element| element.downcast::<gst_app::AppSink>().ok())
            .ok_or_else(|| unavailable(&device, "pipeline has no appsink"))?;

        if let Err(err) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(unavailable(&device, format!("failed to start pipeline: {err:?}")));
        }
        if let Some(bus) = pipeline.bus() {
            if let Err(err) = drain_bus_errors(&device, &bus) {
                let _ = pipeline.set_state(gst::State::Null);
                return Err(err);
            }
        }

        self.running = Some(Running {
            device,
            pipeline,
            appsink,
        });
        Ok(())
    }

    async fn read(&mut self) -> Result<RgbImage, CameraError> {
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| unavailable("gstreamer", "backend is not open"))?;
        let device = running.device.clone();
        let appsink = running.appsink.clone();
        let bus = running.pipeline.bus();

        let pull_device = device.clone();
        tokio::task::spawn_blocking(move || {
            let sample = appsink.try_pull_sample(ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64));
            if let Some(bus) = &bus {
                drain_bus_errors(&pull_device, bus)?;
            }
            match sample {
                Some(sample) => image_from_sample(&pull_device, &sample),
                None if appsink.is_eos() => Err(CameraError::StreamEnded {
                    device: pull_device,
                }),
                None => Err(CameraError::ReadTimeout {
                    device: pull_device,
                    timeout: PULL_TIMEOUT,
                }),
            }
        })
        .await
        .map_err(|err| unavailable(&device, format!("capture task failed: {err}")))?
    }

    async fn close(&mut self) {
        if let Some(running) = self.running.take() {
            if let Err(err) = running.pipeline.set_state(gst::State::Null) {
                tracing::warn!(device = %running.device, "Failed to stop pipeline: {:?}", err);
            }
        }
    }
}

impl Drop for GStreamerBackend {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.pipeline.set_state(gst::State::Null);
        }
    }
}
