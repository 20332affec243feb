use board_detection::board_detection::{
    draw_detection, find_corners, to_gray, BoardPattern, Cmat, MatError,
};
use opencv::{
    core::Mat,
    highgui,
    prelude::*,
    videoio::{self, VideoCapture},
};
use rgb::alt::BGR8;
use thiserror::Error;

pub const KEY_SELECT: i32 = b' ' as i32;
pub const KEY_QUIT: i32 = 27; // escape

const WINDOW_WIDTH: i32 = 1280;
const WINDOW_HEIGHT: i32 = 720;

#[derive(Debug, Error)]
pub enum SelectError {
    #[error(transparent)]
    Opencv(#[from] opencv::Error),
    #[error(transparent)]
    Mat(#[from] MatError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Frames are kept only when the user presses the select key.
    Manual,
    /// Every frame with a complete detection is kept.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Select,
    Quit,
    Idle,
}

pub fn classify_key(code: i32) -> KeyAction {
    match code {
        KEY_QUIT => KeyAction::Quit,
        KEY_SELECT => KeyAction::Select,
        _ => KeyAction::Idle,
    }
}

/// A frame is kept only when the full pattern was found in it, and in manual
/// mode only when the user confirmed it while it was on screen.
pub fn keep_frame(detected: bool, mode: SelectionMode, action: KeyAction) -> bool {
    detected && (mode == SelectionMode::Auto || action == KeyAction::Select)
}

#[derive(Debug, Clone)]
pub struct SelectorOptions {
    pub mode: SelectionMode,
    pub wait_ms: i32,
    pub window_title: String,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        SelectorOptions {
            mode: SelectionMode::Manual,
            wait_ms: 10,
            window_title: "Select chessboard frames".into(),
        }
    }
}

impl SelectorOptions {
    pub fn set_mode(mut self, mode: SelectionMode) -> SelectorOptions {
        self.mode = mode;
        self
    }

    pub fn set_wait_ms(mut self, wait_ms: i32) -> SelectorOptions {
        self.wait_ms = wait_ms;
        self
    }

    pub fn set_window_title(mut self, title: impl Into<String>) -> SelectorOptions {
        self.window_title = title.into();
        self
    }
}

/// Capture handle that releases the underlying stream when dropped.
pub struct VideoSource {
    cap: VideoCapture,
}

impl VideoSource {
    /// `None` when the backend cannot open `path` at all.
    pub fn open(path: &str) -> Result<Option<Self>, SelectError> {
        let cap = VideoCapture::from_file(path, videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            return Ok(None);
        }
        Ok(Some(VideoSource { cap }))
    }

    /// Next decoded frame, or `None` once the stream is exhausted.
    pub fn read_frame(&mut self) -> Result<Option<Mat>, SelectError> {
        let mut frame = Mat::default();
        if !self.cap.read(&mut frame)? || frame.size()?.width < 1 {
            return Ok(None);
        }
        Ok(Some(frame))
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        let _ = self.cap.release();
    }
}

/// Named highgui window, destroyed again when dropped so it does not outlive
/// the selection loop on any exit path.
pub struct DisplayWindow {
    name: String,
}

impl DisplayWindow {
    pub fn open(name: &str) -> Result<Self, SelectError> {
        highgui::named_window(name, highgui::WINDOW_NORMAL)?;
        highgui::resize_window(name, WINDOW_WIDTH, WINDOW_HEIGHT)?;
        Ok(DisplayWindow {
            name: name.to_owned(),
        })
    }

    pub fn show(&self, image: &Mat) -> Result<(), SelectError> {
        highgui::imshow(&self.name, image)?;
        Ok(())
    }

    /// Blocks for at most `wait_ms` milliseconds for a key press.
    pub fn poll_key(&self, wait_ms: i32) -> Result<KeyAction, SelectError> {
        Ok(classify_key(highgui::wait_key(wait_ms)?))
    }
}

impl Drop for DisplayWindow {
    fn drop(&mut self) {
        let _ = highgui::destroy_window(&self.name);
    }
}

/// Plays the video at `video_path` and collects the frames chosen for
/// calibration, in playback order.
///
/// Selected frames are deep copies of the raw frame, without the detection
/// overlay. A video that cannot be opened is reported and yields an empty
/// selection; a quit key returns whatever was collected so far.
pub fn select_frames(
    video_path: &str,
    pattern: &BoardPattern,
    options: &SelectorOptions,
) -> Result<Vec<Cmat<BGR8>>, SelectError> {
    let Some(mut source) = VideoSource::open(video_path)? else {
        log::error!("failed to open video source {video_path}");
        return Ok(Vec::new());
    };

    // The window is only created once the first frame decoded, so an empty
    // stream never touches the display.
    let Some(mut frame) = source.read_frame()? else {
        log::warn!("no readable frames in {video_path}");
        return Ok(Vec::new());
    };
    let window = DisplayWindow::open(&options.window_title)?;

    let mut selected = Vec::new();
    loop {
        let size = frame.size()?;
        log::debug!("frame {}x{}", size.width, size.height);

        let gray = to_gray(&frame)?;
        let detection = find_corners(&gray, pattern)?;

        let mut vis = frame.try_clone()?;
        draw_detection(&mut vis, pattern, detection.as_ref())?;
        window.show(&vis)?;

        let action = window.poll_key(options.wait_ms)?;
        if keep_frame(detection.is_some(), options.mode, action) {
            selected.push(Cmat::copy_of(&frame)?);
            log::info!("selected frame #{}", selected.len());
        }
        if action == KeyAction::Quit {
            break;
        }

        match source.read_frame()? {
            Some(next) => frame = next,
            None => break,
        }
    }

    Ok(selected)
}
