//! Gapless playback of streamed reply audio.
//!
//! Chunks arrive in arbitrary sizes with network jitter. Rather than playing
//! each one immediately, the scheduler places every decoded buffer on a
//! monotonic cursor so chunks play back-to-back with no gap and no overlap.
//! The output clock is the number of samples the mixer has rendered, which
//! keeps scheduling sample-exact and lets tests drive the mixer directly
//! instead of opening a device.

use crate::audio_toolkit::audio::pcm16_bytes_to_f32;
use crate::audio_toolkit::audio::device::find_output_device;
use crate::audio_toolkit::PLAYBACK_SAMPLE_RATE;
use anyhow::Result;
use log::debug;
use rodio::{OutputStream, OutputStreamHandle, Source};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Samples mixed per lock of the shared state.
const RENDER_BLOCK: usize = 256;

/// One decoded buffer placed on the output timeline.
struct PlaybackHandle {
    id: u64,
    start: u64,
    samples: Vec<f32>,
}

impl PlaybackHandle {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// State shared between the scheduler and the mixer source.
struct MixerState {
    /// Samples rendered since the stream started, which is the output clock.
    clock: u64,
    /// Where the next chunk begins. Zero means "not yet scheduled": the next
    /// enqueue starts at the current clock instead of stacking behind audio
    /// that already played or was interrupted.
    next_start: u64,
    active: Vec<PlaybackHandle>,
    next_id: u64,
}

impl MixerState {
    fn new() -> Self {
        Self {
            clock: 0,
            next_start: 0,
            active: Vec::new(),
            next_id: 0,
        }
    }

    fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let begin = self.clock;
        let end = begin + out.len() as u64;

        for handle in &self.active {
            if handle.start >= end || handle.end() <= begin {
                continue;
            }
            let from = handle.start.max(begin);
            let to = handle.end().min(end);
            for position in from..to {
                out[(position - begin) as usize] +=
                    handle.samples[(position - handle.start) as usize];
            }
        }

        self.clock = end;
        // Natural completion only removes the handle. The cursor already
        // accounts for the buffer, so it is left alone.
        self.active.retain(|handle| {
            if handle.end() <= end {
                debug!("chunk {} finished playing", handle.id);
                false
            } else {
                true
            }
        });
    }
}

/// Owns the playback cursor and the set of in-flight handles.
pub struct PlaybackScheduler {
    state: Arc<Mutex<MixerState>>,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MixerState::new())),
        }
    }

    /// Decode one PCM16 chunk and schedule it after everything already
    /// queued. A malformed chunk is rejected without touching the cursor or
    /// any pending handle; playback continues with later chunks.
    pub fn enqueue(&self, chunk: &[u8]) -> Result<u64> {
        let samples = pcm16_bytes_to_f32(chunk)?;

        let mut state = self.state.lock().unwrap();
        let start = state.next_start.max(state.clock);
        let id = state.next_id;
        state.next_id += 1;
        state.next_start = start + samples.len() as u64;
        debug!(
            "scheduled chunk {} at sample {} ({} samples)",
            id,
            start,
            samples.len()
        );
        state.active.push(PlaybackHandle { id, start, samples });
        Ok(id)
    }

    /// Barge-in: stop every active handle and rewind the cursor so the next
    /// chunk plays at the current clock instead of behind dead audio.
    pub fn interrupt(&self) {
        let mut state = self.state.lock().unwrap();
        let stopped = state.active.len();
        state.active.clear();
        state.next_start = 0;
        if stopped > 0 {
            debug!("interrupted {stopped} active handles");
        }
    }

    /// Session reset: cancel pending handles and clear the cursor.
    pub fn reset(&self) {
        self.interrupt();
    }

    pub fn active_handles(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// The mixer end, to hand to an output stream.
    pub fn source(&self) -> SchedulerSource {
        SchedulerSource {
            state: self.state.clone(),
            buffered: VecDeque::new(),
        }
    }
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Infinite mono source that renders the scheduled mix, silence when idle.
pub struct SchedulerSource {
    state: Arc<Mutex<MixerState>>,
    buffered: VecDeque<f32>,
}

impl Iterator for SchedulerSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.buffered.is_empty() {
            let mut block = [0.0f32; RENDER_BLOCK];
            self.state.lock().unwrap().render(&mut block);
            self.buffered.extend(block.iter().copied());
        }
        self.buffered.pop_front()
    }
}

impl Source for SchedulerSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        PLAYBACK_SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Keeps the rodio output stream alive for the lifetime of the session.
pub struct PlaybackOutput {
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

impl PlaybackOutput {
    /// Open the requested output device, or the default one.
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        let (stream, handle) = match find_output_device(device_name)? {
            Some(device) => OutputStream::try_from_device(&device)?,
            None => OutputStream::try_default()?,
        };
        Ok(Self {
            _stream: stream,
            handle,
        })
    }

    /// Start pulling the scheduler's mix through this output.
    pub fn attach(&self, scheduler: &PlaybackScheduler) -> Result<()> {
        self.handle.play_raw(scheduler.source())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_toolkit::audio::f32_to_pcm16_bytes;

    fn chunk_of(samples: usize, value: f32) -> Vec<u8> {
        f32_to_pcm16_bytes(&vec![value; samples])
    }

    fn snapshot(scheduler: &PlaybackScheduler) -> (u64, u64) {
        let state = scheduler.state.lock().unwrap();
        (state.clock, state.next_start)
    }

    fn starts(scheduler: &PlaybackScheduler) -> Vec<u64> {
        let state = scheduler.state.lock().unwrap();
        state.active.iter().map(|h| h.start).collect()
    }

    fn render(scheduler: &PlaybackScheduler, samples: usize) -> Vec<f32> {
        let mut out = vec![0.0; samples];
        scheduler.state.lock().unwrap().render(&mut out);
        out
    }

    #[test]
    fn chunks_are_scheduled_back_to_back() {
        let scheduler = PlaybackScheduler::new();
        scheduler.enqueue(&chunk_of(100, 0.1)).unwrap();
        scheduler.enqueue(&chunk_of(50, 0.1)).unwrap();
        scheduler.enqueue(&chunk_of(25, 0.1)).unwrap();

        assert_eq!(starts(&scheduler), vec![0, 100, 150]);
        assert_eq!(snapshot(&scheduler), (0, 175));
    }

    #[test]
    fn late_chunk_starts_at_current_clock() {
        let scheduler = PlaybackScheduler::new();
        scheduler.enqueue(&chunk_of(100, 0.1)).unwrap();

        // Playback runs past the end of the queue before the next chunk
        // arrives, so it cannot start in the past.
        render(&scheduler, 300);
        scheduler.enqueue(&chunk_of(40, 0.1)).unwrap();

        assert_eq!(starts(&scheduler), vec![300]);
        assert_eq!(snapshot(&scheduler), (300, 340));
    }

    #[test]
    fn natural_completion_removes_handle_but_keeps_cursor() {
        let scheduler = PlaybackScheduler::new();
        scheduler.enqueue(&chunk_of(100, 0.1)).unwrap();
        scheduler.enqueue(&chunk_of(100, 0.1)).unwrap();

        render(&scheduler, 150);
        assert_eq!(scheduler.active_handles(), 1);
        assert_eq!(snapshot(&scheduler), (150, 200));
    }

    #[test]
    fn interrupt_clears_handles_and_rewinds_cursor() {
        let scheduler = PlaybackScheduler::new();
        scheduler.enqueue(&chunk_of(100, 0.1)).unwrap();
        scheduler.enqueue(&chunk_of(100, 0.1)).unwrap();
        render(&scheduler, 60);

        scheduler.interrupt();
        assert_eq!(scheduler.active_handles(), 0);

        // The next chunk plays now, not after the interrupted audio.
        scheduler.enqueue(&chunk_of(30, 0.1)).unwrap();
        assert_eq!(starts(&scheduler), vec![60]);
        assert_eq!(snapshot(&scheduler), (60, 90));
    }

    #[test]
    fn interrupt_is_idempotent_with_no_active_handles() {
        let scheduler = PlaybackScheduler::new();
        scheduler.interrupt();
        scheduler.interrupt();
        assert_eq!(scheduler.active_handles(), 0);
        assert_eq!(snapshot(&scheduler), (0, 0));
    }

    #[test]
    fn reset_then_enqueue_matches_fresh_scheduler() {
        let used = PlaybackScheduler::new();
        used.enqueue(&chunk_of(200, 0.1)).unwrap();
        render(&used, 80);
        used.reset();

        // Same as a fresh scheduler's first enqueue: starts at the clock.
        used.enqueue(&chunk_of(40, 0.1)).unwrap();
        let (clock, next_start) = snapshot(&used);
        assert_eq!(starts(&used), vec![clock]);
        assert_eq!(next_start, clock + 40);
    }

    #[test]
    fn decode_failure_is_isolated() {
        let scheduler = PlaybackScheduler::new();
        scheduler.enqueue(&chunk_of(100, 0.1)).unwrap();

        assert!(scheduler.enqueue(&[1, 2, 3]).is_err());
        assert!(scheduler.enqueue(&[]).is_err());

        // Cursor and pending handles are untouched; the next good chunk
        // schedules exactly where it would have.
        assert_eq!(scheduler.active_handles(), 1);
        assert_eq!(snapshot(&scheduler), (0, 100));
        scheduler.enqueue(&chunk_of(10, 0.1)).unwrap();
        assert_eq!(starts(&scheduler), vec![0, 100]);
    }

    #[test]
    fn render_plays_scheduled_samples_then_silence() {
        let scheduler = PlaybackScheduler::new();
        scheduler.enqueue(&f32_to_pcm16_bytes(&[0.5, -0.5])).unwrap();

        let out = render(&scheduler, 4);
        assert!((out[0] - 0.5).abs() < 0.001);
        assert!((out[1] + 0.5).abs() < 0.001);
        assert_eq!(&out[2..], &[0.0, 0.0]);
        assert_eq!(scheduler.active_handles(), 0);
    }

    #[test]
    fn source_emits_silence_when_idle() {
        let scheduler = PlaybackScheduler::new();
        let mut source = scheduler.source();
        assert_eq!(source.channels(), 1);
        assert_eq!(source.sample_rate(), PLAYBACK_SAMPLE_RATE);
        for _ in 0..RENDER_BLOCK * 2 {
            assert_eq!(source.next(), Some(0.0));
        }
    }
}
