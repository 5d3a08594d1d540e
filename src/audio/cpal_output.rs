//! CPAL-backed audio device
//!
//! The cpal stream pulls samples from a lock-free ring filled by
//! [`AudioDevice::write`]. Its data callback emulates the PCM state machine:
//! the stream starts once a period is queued, falls into `Xrun` when the
//! ring runs dry and leaves `Draining` for `Prepared` once played out.
//!
//! `cpal::Stream` is not `Send` on every platform, so the stream lives on a
//! dedicated holder thread for the lifetime of the device.

use crate::audio::{AudioDevice, AudioHost, AudioParams, DeviceError, DeviceState, DeviceStatus, HwParams};
use crate::utils::error::{IntoPlayerError, PlayerError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest time `drain` waits for the callback to play out
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct CallbackState {
    consumer: HeapCons<i16>,
    state: DeviceState,
    trigger: Instant,
    /// Frames pulled by the callback since the last start
    played: u64,
    failure: Option<String>,
}

/// Opens the default cpal output device
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalHost;

impl AudioHost for CpalHost {
    fn open(&self, params: &AudioParams) -> Result<Box<dyn AudioDevice>> {
        Ok(Box::new(CpalDevice::open(*params)?))
    }
}

/// An output stream on the default cpal device
pub struct CpalDevice {
    params: AudioParams,
    producer: HeapProd<i16>,
    shared: Arc<Mutex<CallbackState>>,
    origin: Instant,
    stop: Option<Sender<()>>,
    holder: Option<JoinHandle<()>>,
}

impl CpalDevice {
    /// Build and start the cpal stream for `params`
    pub fn open(params: AudioParams) -> Result<Self> {
        let capacity = params.buffer_frames as usize * params.channels as usize;
        let (producer, consumer) = HeapRb::<i16>::new(capacity.max(1)).split();
        let origin = Instant::now();
        let shared = Arc::new(Mutex::new(CallbackState {
            consumer,
            state: DeviceState::Prepared,
            trigger: origin,
            played: 0,
            failure: None,
        }));

        let (ready_tx, ready_rx) = bounded::<Result<String>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let callback_state = Arc::clone(&shared);
        let holder = thread::Builder::new()
            .name("cpal-stream".to_string())
            .spawn(move || {
                let stream = match build_stream(params, callback_state) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // parked until the device is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        let name = ready_rx
            .recv()
            .device_err("cpal stream thread exited")??;
        info!(
            "Audio device '{}' opened ({} Hz, {} ch, buffer {} frames)",
            name, params.sample_rate, params.channels, params.buffer_frames
        );

        Ok(Self {
            params,
            producer,
            shared,
            origin,
            stop: Some(stop_tx),
            holder: Some(holder),
        })
    }

    fn queued_frames(&self) -> u64 {
        (self.producer.occupied_len() / self.params.channels.max(1) as usize) as u64
    }
}

fn build_stream(params: AudioParams, shared: Arc<Mutex<CallbackState>>) -> Result<(cpal::Stream, String)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlayerError::DeviceFatal("No default output device found".to_string()))?;
    let name = device.name().unwrap_or_else(|_| "default".to_string());

    let config = StreamConfig {
        channels: params.channels,
        sample_rate: SampleRate(params.sample_rate),
        buffer_size: BufferSize::Fixed(params.period_frames),
    };
    let channels = params.channels.max(1) as usize;
    let error_state = Arc::clone(&shared);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                let mut state = shared.lock();
                match state.state {
                    DeviceState::Running | DeviceState::Draining => {
                        let filled = state.consumer.pop_slice(data);
                        data[filled..].fill(0);
                        state.played += (filled / channels) as u64;
                        if filled < data.len() {
                            state.state = match state.state {
                                DeviceState::Draining => DeviceState::Prepared,
                                _ => DeviceState::Xrun,
                            };
                        }
                    }
                    _ => data.fill(0),
                }
            },
            move |err: cpal::StreamError| {
                error!("Audio stream error: {}", err);
                let mut state = error_state.lock();
                state.state = DeviceState::Disconnected;
                state.failure = Some(err.to_string());
            },
            None,
        )
        .device_err("Failed to create audio stream")?;
    stream.play().device_err("Failed to start audio stream")?;
    Ok((stream, name))
}

impl AudioDevice for CpalDevice {
    fn hw_params(&self) -> HwParams {
        HwParams {
            buffer_frames: self.params.buffer_frames,
            period_frames: self.params.period_frames,
        }
    }

    fn write(&mut self, samples: &[i16]) -> std::result::Result<usize, DeviceError> {
        let mut state = self.shared.lock();
        match state.state {
            DeviceState::Xrun => return Err(DeviceError::Xrun),
            DeviceState::Suspended => return Err(DeviceError::Suspended),
            DeviceState::Disconnected => {
                let reason = state.failure.clone().unwrap_or_else(|| "device disconnected".to_string());
                return Err(DeviceError::Fatal(reason));
            }
            _ => {}
        }

        let channels = self.params.channels.max(1) as usize;
        let vacant_frames = self.producer.vacant_len() / channels;
        if vacant_frames == 0 {
            return Err(DeviceError::WouldBlock);
        }
        let frames = (samples.len() / channels).min(vacant_frames);
        let pushed = self.producer.push_slice(&samples[..frames * channels]);

        if state.state == DeviceState::Prepared && self.queued_frames() >= self.params.period_frames as u64 {
            state.state = DeviceState::Running;
            state.trigger = Instant::now();
            state.played = 0;
        }
        Ok(pushed / channels)
    }

    fn status(&mut self) -> DeviceStatus {
        let state = self.shared.lock();
        let trigger_tstamp = state.trigger.duration_since(self.origin);
        let delay = self.queued_frames();
        DeviceStatus {
            state: state.state,
            htstamp: trigger_tstamp + self.params.frames_to_duration(state.played),
            trigger_tstamp,
            delay_frames: delay as u32,
            avail_frames: (self.params.buffer_frames as u64).saturating_sub(delay) as u32,
        }
    }

    fn recover(&mut self, error: &DeviceError) -> std::result::Result<(), DeviceError> {
        let mut state = self.shared.lock();
        if state.state == DeviceState::Disconnected {
            return Err(DeviceError::Fatal(format!("cannot recover from {}", error)));
        }
        state.consumer.clear();
        state.state = DeviceState::Prepared;
        Ok(())
    }

    fn reset(&mut self) -> std::result::Result<(), DeviceError> {
        let mut state = self.shared.lock();
        state.consumer.clear();
        if state.state != DeviceState::Disconnected {
            state.state = DeviceState::Prepared;
        }
        Ok(())
    }

    fn drain(&mut self) -> std::result::Result<(), DeviceError> {
        {
            let mut state = self.shared.lock();
            match state.state {
                DeviceState::Running => state.state = DeviceState::Draining,
                DeviceState::Prepared if self.queued_frames() > 0 => {
                    state.state = DeviceState::Draining;
                    state.trigger = Instant::now();
                    state.played = 0;
                }
                _ => return Ok(()),
            }
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.shared.lock().state == DeviceState::Draining {
            if Instant::now() >= deadline {
                warn!("Audio drain timed out");
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.reset()
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(holder) = self.holder.take() {
            if holder.join().is_err() {
                warn!("cpal stream thread panicked");
            }
        }
    }
}
