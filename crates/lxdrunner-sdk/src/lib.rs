// lxdrunner-sdk: foundation layer for LXDRunner.
// No dependencies on other lxdrunner crates; holds the logging seam and the
// small string/filesystem helpers the engine builds on.

pub mod build_constants;
pub mod io_util;
pub mod string_util;
pub mod trace;

pub use build_constants::{BuildInfo, Source};
pub use io_util::IOUtil;
pub use string_util::StringUtil;
pub use trace::{CollectingTraceWriter, TraceLevel, TraceWriter, TracingTraceWriter};
