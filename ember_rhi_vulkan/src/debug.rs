/// Vulkan Debug Messenger - Handles validation layer messages with colored output
///
/// Reports validation messages to the console and/or a log file, counts them
/// per severity and optionally aborts or panics on the first error. The
/// messenger callback is only compiled in with the `vulkan-validation`
/// feature; the counters are always available and stay at zero without it.

use ash::vk;
use colored::*;
use ember_rhi::ember::render::{DebugMessageFilter, DebugOutput, DebugSeverity, ValidationStats};
use rustc_hash::FxHashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Global debug configuration (shared across callbacks)
static DEBUG_CONFIG: Mutex<Option<Config>> = Mutex::new(None);

/// Global validation statistics
static VALIDATION_STATS: ValidationStatsTracker = ValidationStatsTracker::new();

/// Occurrence count per message text, for grouping repeats
static MESSAGE_TRACKER: Mutex<Option<FxHashMap<String, u32>>> = Mutex::new(None);

/// Debug configuration for the callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub severity: DebugSeverity,
    pub output: DebugOutput,
    pub message_filter: DebugMessageFilter,
    pub break_on_error: bool,
    pub panic_on_error: bool,
    pub enable_stats: bool,
}

struct ValidationStatsTracker {
    errors: AtomicU32,
    warnings: AtomicU32,
    info: AtomicU32,
    verbose: AtomicU32,
}

impl ValidationStatsTracker {
    const fn new() -> Self {
        Self {
            errors: AtomicU32::new(0),
            warnings: AtomicU32::new(0),
            info: AtomicU32::new(0),
            verbose: AtomicU32::new(0),
        }
    }

    fn record(&self, level: Level) {
        let counter = match level {
            Level::Error => &self.errors,
            Level::Warning => &self.warnings,
            Level::Info => &self.info,
            Level::Verbose => &self.verbose,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ValidationStats {
        ValidationStats {
            errors: self.errors.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            info: self.info.load(Ordering::Relaxed),
            verbose: self.verbose.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.errors.store(0, Ordering::Relaxed);
        self.warnings.store(0, Ordering::Relaxed);
        self.info.store(0, Ordering::Relaxed);
        self.verbose.store(0, Ordering::Relaxed);
    }
}

/// Highest severity bit of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Level {
    Error,
    Warning,
    Info,
    Verbose,
}

impl Level {
    pub(crate) fn from_vk(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            Level::Error
        } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            Level::Warning
        } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            Level::Info
        } else {
            Level::Verbose
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warning => "WARNING",
            Level::Info => "INFO",
            Level::Verbose => "VERBOSE",
        }
    }

    fn colored_label(&self) -> ColoredString {
        match self {
            Level::Error => self.label().red().bold(),
            Level::Warning => self.label().yellow().bold(),
            Level::Info => self.label().cyan(),
            Level::Verbose => self.label().bright_black(),
        }
    }
}

/// Category of a message, as shown in the report
pub(crate) fn type_label(message_type: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "Validation"
    } else if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "Performance"
    } else {
        "General"
    }
}

/// Severity flags the messenger subscribes to
pub(crate) fn severity_flags(severity: DebugSeverity) -> vk::DebugUtilsMessageSeverityFlagsEXT {
    use ash::vk::DebugUtilsMessageSeverityFlagsEXT as S;
    match severity {
        DebugSeverity::ErrorsOnly => S::ERROR,
        DebugSeverity::ErrorsAndWarnings => S::ERROR | S::WARNING,
        DebugSeverity::All => S::ERROR | S::WARNING | S::INFO | S::VERBOSE,
    }
}

/// Whether a message passes the configured severity and category filters
pub(crate) fn should_report(
    config: &Config,
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
) -> bool {
    if !severity_flags(config.severity).intersects(severity) {
        return false;
    }
    if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        config.message_filter.show_validation
    } else if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        config.message_filter.show_performance
    } else {
        config.message_filter.show_general
    }
}

/// Plain-text report line, as written to log files
pub(crate) fn format_plain(level: Level, type_str: &str, occurrences: u32, message_id: &str, message: &str) -> String {
    format!(
        "[VULKAN {}] [{}]{}\n  ├─ Message ID: {}\n  └─ {}\n",
        level.label(), type_str, repeat_indicator(occurrences), message_id, message
    )
}

fn format_console(level: Level, type_str: &str, occurrences: u32, message_id: &str, message: &str) -> String {
    format!(
        "{} {} [{}]{}\n  ├─ {}: {}\n  └─ {}\n",
        "[VULKAN".bright_blue().bold(),
        format!("{}]", level.colored_label()).bright_blue().bold(),
        type_str.bright_black(),
        repeat_indicator(occurrences).yellow(),
        "Message ID".bright_black(),
        message_id.white(),
        message.white()
    )
}

fn repeat_indicator(occurrences: u32) -> String {
    if occurrences > 1 {
        format!(" [×{}]", occurrences)
    } else {
        String::new()
    }
}

// Poisoning only means a reporting thread panicked; the data is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Install the callback configuration and reset counters
pub fn init_debug_config(config: Config) {
    VALIDATION_STATS.reset();
    *lock(&MESSAGE_TRACKER) = Some(FxHashMap::default());
    *lock(&DEBUG_CONFIG) = Some(config);
}

/// Stop reporting; late callbacks during teardown are ignored
pub fn cleanup_debug_config() {
    *lock(&DEBUG_CONFIG) = None;
    *lock(&MESSAGE_TRACKER) = None;
}

pub fn get_validation_stats() -> ValidationStats {
    VALIDATION_STATS.snapshot()
}

/// Count one occurrence of `message`; returns how often it has been seen
fn track_message(message: &str) -> u32 {
    let mut tracker = lock(&MESSAGE_TRACKER);
    let messages = tracker.get_or_insert_with(FxHashMap::default);
    let count = messages.entry(message.to_string()).or_insert(0);
    *count += 1;
    *count
}

/// Print a summary of the validation messages seen so far
pub fn print_validation_stats_report() {
    let stats = get_validation_stats();

    if stats.total() == 0 {
        println!("\n{}", "✓ No validation messages".green().bold());
        return;
    }

    println!("\n{}", "=== Validation Statistics Report ===".bright_blue().bold());
    if stats.errors > 0 {
        println!("  {} {}", "Errors:".red().bold(), stats.errors);
    }
    if stats.warnings > 0 {
        println!("  {} {}", "Warnings:".yellow().bold(), stats.warnings);
    }
    if stats.info > 0 {
        println!("  {} {}", "Info:".cyan(), stats.info);
    }
    if stats.verbose > 0 {
        println!("  {} {}", "Verbose:".bright_black(), stats.verbose);
    }
    println!("  {} {}", "Total:".white().bold(), stats.total());

    let repeated = lock(&MESSAGE_TRACKER)
        .as_ref()
        .map(|messages| messages.values().filter(|&&count| count > 1).count())
        .unwrap_or(0);
    if repeated > 0 {
        println!("\n  {} {} message(s) appeared multiple times", "ℹ".cyan(), repeated);
    }
    println!("{}\n", "====================================".bright_blue().bold());
}

/// Report one message; returns the level when the message passed the filters
pub(crate) fn report(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    message_id: &str,
    message: &str,
) -> Option<Level> {
    let config = lock(&DEBUG_CONFIG).clone()?;
    if !should_report(&config, severity, message_type) {
        return None;
    }

    let level = Level::from_vk(severity);
    let type_str = type_label(message_type);
    let occurrences = if config.enable_stats {
        VALIDATION_STATS.record(level);
        track_message(message)
    } else {
        1
    };

    match &config.output {
        DebugOutput::Console => {
            eprint!("{}", format_console(level, type_str, occurrences, message_id, message));
        }
        DebugOutput::File(path) => {
            write_to_file(path, &format_plain(level, type_str, occurrences, message_id, message));
        }
        DebugOutput::Both(path) => {
            eprint!("{}", format_console(level, type_str, occurrences, message_id, message));
            write_to_file(path, &format_plain(level, type_str, occurrences, message_id, message));
        }
    }

    if level == Level::Error && config.panic_on_error {
        panic!(
            "\n⚠️  PANIC ON ERROR (Strict Mode)\nMessage ID: {}\nType: {}\nMessage: {}\n",
            message_id, type_str, message
        );
    }
    if level == Level::Error && config.break_on_error {
        eprintln!(
            "\n{}\n  Context: {} [{}]\n  Message: {}\n",
            "⚠️  BREAK ON VALIDATION ERROR - Aborting execution".red().bold(),
            message_id.yellow(),
            type_str.cyan(),
            message.white()
        );
        std::process::abort();
    }
    Some(level)
}

fn write_to_file(path: &str, message: &str) {
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", message);
    }
}

/// Vulkan debug messenger callback
///
/// # Safety
///
/// Called by the validation layers with a valid callback data pointer.
#[cfg(feature = "vulkan-validation")]
pub unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    use std::ffi::CStr;

    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let callback_data = &*p_callback_data;
    let message_id = if callback_data.p_message_id_name.is_null() {
        "Unknown".into()
    } else {
        CStr::from_ptr(callback_data.p_message_id_name).to_string_lossy()
    };
    let message = if callback_data.p_message.is_null() {
        "No message".into()
    } else {
        CStr::from_ptr(callback_data.p_message).to_string_lossy()
    };

    report(message_severity, message_type, &message_id, &message);
    // Never abort the Vulkan call itself
    vk::FALSE
}

#[cfg(test)]
#[path = "debug_tests.rs"]
mod tests;
