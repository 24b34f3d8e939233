//! CPAL host driving an [`AudioProcessor`] from the default devices.
//!
//! The input callback downmixes to mono and pushes into a ring buffer. The
//! output callback pops what it needs, runs the processor and fans the mono
//! result out to every output channel.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;

use crate::{AudioProcessor, PipelineError};

/// Seconds of input the capture ring can hold.
const CAPTURE_SECONDS: usize = 2;

/// Largest callback the scratch buffers are sized for up front.
const SCRATCH_FRAMES: usize = 8192;

/// Running input and output streams.
///
/// Audio flows for as long as this value is alive.
#[must_use]
pub struct AudioHost {
    _input: Stream,
    _output: Stream,
    sample_rate: u32,
}

impl AudioHost {
    /// Opens the default input and output devices and starts both streams.
    ///
    /// # Errors
    ///
    /// Returns `Host` if either device is missing, uses a non-`f32` format,
    /// or its stream cannot be built or started.
    pub fn start_default(mut processor: AudioProcessor) -> Result<Self, PipelineError> {
        let host = cpal::default_host();
        let input = host
            .default_input_device()
            .ok_or_else(|| PipelineError::Host("no default input device".into()))?;
        let output = host
            .default_output_device()
            .ok_or_else(|| PipelineError::Host("no default output device".into()))?;

        let in_supported = input.default_input_config().map_err(host_error)?;
        let out_supported = output.default_output_config().map_err(host_error)?;
        for format in [in_supported.sample_format(), out_supported.sample_format()] {
            if format != SampleFormat::F32 {
                return Err(PipelineError::Host(format!(
                    "unsupported sample format {format:?}"
                )));
            }
        }

        let in_config: StreamConfig = in_supported.into();
        let out_config: StreamConfig = out_supported.into();
        let sample_rate = out_config.sample_rate.0;
        if in_config.sample_rate != out_config.sample_rate {
            tracing::warn!(
                input_rate = in_config.sample_rate.0,
                output_rate = sample_rate,
                "Input and output sample rates differ"
            );
        }

        let (mut producer, mut consumer) =
            HeapRb::<f32>::new(sample_rate as usize * CAPTURE_SECONDS).split();

        let in_channels = usize::from(in_config.channels).max(1);
        let input_stream = input
            .build_input_stream(
                &in_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for frame in data.chunks(in_channels) {
                        let mono = frame.iter().sum::<f32>() / frame.len() as f32;
                        // Drops input if the output side stalls
                        let _ = producer.try_push(mono);
                    }
                },
                |err| tracing::error!("Input stream error: {}", err),
                None,
            )
            .map_err(host_error)?;

        let out_channels = usize::from(out_config.channels).max(1);
        let mut captured = vec![0.0f32; SCRATCH_FRAMES];
        let mut rendered = vec![0.0f32; SCRATCH_FRAMES];
        let output_stream = output
            .build_output_stream(
                &out_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / out_channels;
                    if frames > captured.len() {
                        captured.resize(frames, 0.0);
                        rendered.resize(frames, 0.0);
                    }

                    let popped = consumer.pop_slice(&mut captured[..frames]);
                    processor.process(&captured[..popped], &mut rendered[..frames]);

                    for (frame, &sample) in data.chunks_mut(out_channels).zip(&rendered) {
                        frame.fill(sample);
                    }
                },
                |err| tracing::error!("Output stream error: {}", err),
                None,
            )
            .map_err(host_error)?;

        input_stream.play().map_err(host_error)?;
        output_stream.play().map_err(host_error)?;

        tracing::info!(sample_rate, "Audio host started");
        Ok(Self {
            _input: input_stream,
            _output: output_stream,
            sample_rate,
        })
    }

    /// Output sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

fn host_error(err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Host(err.to_string())
}
