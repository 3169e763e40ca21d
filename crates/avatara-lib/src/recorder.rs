//! Session recording through ffmpeg.
//!
//! While armed, the pacer mirrors every composed frame and audio sub-chunk
//! here. Video goes to one ffmpeg child as raw rgb24, audio to another as
//! s16le; `stop` closes both pipes and muxes the results into one mp4.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Mutex;

use image::RgbImage;
use tracing::{info, warn};

use avatara_core::wav::SAMPLE_RATE;

use crate::error::RecordError;

struct Pipes {
    video: Child,
    audio: Child,
    video_in: ChildStdin,
    audio_in: ChildStdin,
    video_path: PathBuf,
    audio_path: PathBuf,
}

enum State {
    Idle,
    /// Waiting for the first frame to learn the video size.
    Armed,
    Running(Pipes),
}

pub struct Recorder {
    ffmpeg: PathBuf,
    dir: PathBuf,
    session_id: u32,
    video_fps: u32,
    state: Mutex<State>,
}

impl Recorder {
    pub fn new(ffmpeg: &Path, dir: &Path, session_id: u32, video_fps: u32) -> Self {
        Self {
            ffmpeg: ffmpeg.to_path_buf(),
            dir: dir.to_path_buf(),
            session_id,
            video_fps,
            state: Mutex::new(State::Idle),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.join(format!("record-{}.mp4", self.session_id))
    }

    pub fn is_recording(&self) -> bool {
        !matches!(*self.lock(), State::Idle)
    }

    pub fn start(&self) -> Result<(), RecordError> {
        let mut state = self.lock();
        if !matches!(*state, State::Idle) {
            return Err(RecordError::AlreadyRecording);
        }
        fs::create_dir_all(&self.dir)?;
        *state = State::Armed;
        info!("session {}: recording armed", self.session_id);
        Ok(())
    }

    pub fn write_video(&self, frame: &RgbImage) {
        let mut state = self.lock();
        if matches!(*state, State::Armed) {
            match self.spawn(frame.width(), frame.height()) {
                Ok(pipes) => *state = State::Running(pipes),
                Err(e) => {
                    warn!("session {}: recording failed to start: {e}", self.session_id);
                    *state = State::Idle;
                    return;
                }
            }
        }
        if let State::Running(pipes) = &mut *state {
            if let Err(e) = pipes.video_in.write_all(frame.as_raw()) {
                warn!("session {}: video pipe failed, recording aborted: {e}", self.session_id);
                abort(std::mem::replace(&mut *state, State::Idle));
            }
        }
    }

    pub fn write_audio(&self, pcm: &[u8]) {
        let mut state = self.lock();
        if let State::Running(pipes) = &mut *state {
            if let Err(e) = pipes.audio_in.write_all(pcm) {
                warn!("session {}: audio pipe failed, recording aborted: {e}", self.session_id);
                abort(std::mem::replace(&mut *state, State::Idle));
            }
        }
    }

    /// Finish the recording and mux it. Returns the output path.
    pub fn stop(&self) -> Result<PathBuf, RecordError> {
        let previous = std::mem::replace(&mut *self.lock(), State::Idle);
        let pipes = match previous {
            State::Idle => return Err(RecordError::NotRecording),
            State::Armed => return Err(RecordError::Mux("no frames were recorded".into())),
            State::Running(pipes) => pipes,
        };
        let Pipes {
            mut video,
            mut audio,
            video_in,
            audio_in,
            video_path,
            audio_path,
        } = pipes;
        drop(video_in);
        drop(audio_in);
        let video_status = video.wait()?;
        let audio_status = audio.wait()?;
        if !video_status.success() || !audio_status.success() {
            return Err(RecordError::Mux(format!(
                "encoders exited with {video_status} / {audio_status}"
            )));
        }

        let output = self.output_path();
        let status = Command::new(&self.ffmpeg)
            .args(mux_args(&video_path, &audio_path, &output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(RecordError::Spawn)?;
        let _ = fs::remove_file(&video_path);
        let _ = fs::remove_file(&audio_path);
        if !status.success() {
            return Err(RecordError::Mux(format!("ffmpeg mux exited with {status}")));
        }
        info!("session {}: recording saved to {}", self.session_id, output.display());
        Ok(output)
    }

    fn spawn(&self, width: u32, height: u32) -> Result<Pipes, RecordError> {
        let video_path = self.dir.join(format!("record-{}-video.mp4", self.session_id));
        let audio_path = self.dir.join(format!("record-{}-audio.aac", self.session_id));

        let mut video = self.encoder(video_args(width, height, self.video_fps, &video_path))?;
        let mut audio = match self.encoder(audio_args(&audio_path)) {
            Ok(child) => child,
            Err(e) => {
                let _ = video.kill();
                let _ = video.wait();
                return Err(e);
            }
        };
        let (Some(video_in), Some(audio_in)) = (video.stdin.take(), audio.stdin.take()) else {
            let _ = video.kill();
            let _ = audio.kill();
            return Err(RecordError::Mux("encoder stdin unavailable".into()));
        };
        info!("session {}: recording {width}x{height}", self.session_id);
        Ok(Pipes {
            video,
            audio,
            video_in,
            audio_in,
            video_path,
            audio_path,
        })
    }

    fn encoder(&self, args: Vec<String>) -> Result<Child, RecordError> {
        Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(RecordError::Spawn)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let State::Running(_) = &*self.lock() {
            warn!("session {}: recorder dropped while running", self.session_id);
        }
        abort(std::mem::replace(&mut *self.lock(), State::Idle));
    }
}

fn abort(state: State) {
    if let State::Running(mut pipes) = state {
        let _ = pipes.video.kill();
        let _ = pipes.audio.kill();
        let _ = pipes.video.wait();
        let _ = pipes.audio.wait();
    }
}

fn video_args(width: u32, height: u32, fps: u32, out: &Path) -> Vec<String> {
    [
        "-y", "-f", "rawvideo", "-pix_fmt", "rgb24", "-s",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain([
        format!("{width}x{height}"),
        "-r".into(),
        fps.to_string(),
        "-i".into(),
        "-".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-vcodec".into(),
        "libx264".into(),
        out.display().to_string(),
    ])
    .collect()
}

fn audio_args(out: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-f".into(),
        "s16le".into(),
        "-ar".into(),
        SAMPLE_RATE.to_string(),
        "-ac".into(),
        "1".into(),
        "-i".into(),
        "-".into(),
        "-acodec".into(),
        "aac".into(),
        out.display().to_string(),
    ]
}

fn mux_args(video: &Path, audio: &Path, out: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        audio.display().to_string(),
        "-i".into(),
        video.display().to_string(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "copy".into(),
        out.display().to_string(),
    ]
}
