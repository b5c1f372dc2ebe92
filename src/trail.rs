use std::cell::RefCell;
use std::io;
use std::marker::PhantomData;
use std::panic::Location;

/// Maximum number of frames rendered in a trail.
pub const TRACEBACK_DEPTH: usize = 10;

/// A recorded call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub file: &'static str,
    pub line: u32,
}

thread_local! {
    static TRAIL: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard recording the caller's location on the current thread's frame
/// stack. Instrumented call sites open a scope on entry; nested scopes build
/// the trail that [`TrailLogger`] prefixes to log lines.
///
/// Capturing locations explicitly at the call site keeps the adapter free of
/// runtime stack introspection; the trade-off is that only instrumented
/// frames appear in the trail.
pub struct TrailScope {
    // Frames live in a thread-local, so the guard must not cross threads.
    _not_send: PhantomData<*const ()>,
}

impl TrailScope {
    #[track_caller]
    pub fn enter() -> Self {
        let loc = Location::caller();
        TRAIL.with(|t| {
            t.borrow_mut().push(Frame {
                file: loc.file(),
                line: loc.line(),
            })
        });
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for TrailScope {
    fn drop(&mut self) {
        TRAIL.with(|t| {
            t.borrow_mut().pop();
        });
    }
}

/// Line-oriented log sink that prefixes each line with the caller trail.
///
/// Wraps any `Fn(&str)` sink; `io::Write` is also implemented so the adapter
/// can stand in wherever a writer is expected. The adapter annotates lines,
/// it never filters their content.
pub struct TrailLogger {
    sink: Box<dyn Fn(&str) + Send + Sync>,
}

impl TrailLogger {
    pub fn new(sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            sink: Box::new(sink),
        }
    }

    /// Adapter feeding the crate's debug log channel.
    pub fn to_tracing_debug() -> Self {
        Self::new(|line| tracing::debug!(target: "turnstile::trail", "{}", line))
    }

    pub fn write_line(&self, msg: &str) {
        let prefix = TRAIL.with(|t| format_trail(&t.borrow()));
        (self.sink)(&format!("{}{}", prefix, msg));
    }
}

impl io::Write for TrailLogger {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        self.write_line(line.trim_end_matches('\n'));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Render a bracketed, arrow-joined `file:line` trail from the frame stack
/// (innermost frame last).
///
/// Selection: anchor on the innermost frame that is not internal/generated,
/// then walk outward collecting up to [`TRACEBACK_DEPTH`] frames, skipping
/// internal ones and stopping early at any frame outside Rust source. Only
/// basenames are rendered, oldest frame first. No qualifying frame yields an
/// empty prefix.
pub(crate) fn format_trail(frames: &[Frame]) -> String {
    let Some(anchor) = frames.iter().rposition(|f| !is_internal(f.file)) else {
        return String::new();
    };

    let mut collected: Vec<Frame> = Vec::new();
    for idx in (0..=anchor).rev() {
        if collected.len() == TRACEBACK_DEPTH {
            break;
        }
        let frame = frames[idx];
        if is_internal(frame.file) {
            continue;
        }
        if !frame.file.ends_with(".rs") {
            break;
        }
        collected.push(frame);
    }

    if collected.is_empty() {
        return String::new();
    }

    // Oldest caller first.
    collected.reverse();
    let joined = collected
        .iter()
        .map(|f| format!("{}:{}", basename(f.file), f.line))
        .collect::<Vec<_>>()
        .join(" -> ");
    format!("[{}] ", joined)
}

fn is_internal(file: &str) -> bool {
    file.starts_with("/rustc/")
        || file.contains("/library/")
        || basename(file).starts_with('<')
}

fn basename(file: &str) -> &str {
    file.rsplit(['/', '\\']).next().unwrap_or(file)
}
