//! Unit tests for validation message filtering and counting

use super::*;
use serial_test::serial;

use ash::vk::DebugUtilsMessageSeverityFlagsEXT as Severity;
use ash::vk::DebugUtilsMessageTypeFlagsEXT as Type;

fn config(severity: DebugSeverity) -> Config {
    Config {
        severity,
        output: DebugOutput::File(std::env::temp_dir().join("ember_debug_tests.log").to_string_lossy().into_owned()),
        message_filter: DebugMessageFilter::default(),
        break_on_error: false,
        panic_on_error: false,
        enable_stats: true,
    }
}

// ============================================================================
// FILTERS
// ============================================================================

#[test]
fn test_level_uses_highest_severity_bit() {
    assert_eq!(Level::from_vk(Severity::ERROR | Severity::WARNING), Level::Error);
    assert_eq!(Level::from_vk(Severity::WARNING), Level::Warning);
    assert_eq!(Level::from_vk(Severity::INFO), Level::Info);
    assert_eq!(Level::from_vk(Severity::VERBOSE), Level::Verbose);
}

#[test]
fn test_severity_filter() {
    let errors_only = config(DebugSeverity::ErrorsOnly);
    assert!(should_report(&errors_only, Severity::ERROR, Type::VALIDATION));
    assert!(!should_report(&errors_only, Severity::WARNING, Type::VALIDATION));

    let all = config(DebugSeverity::All);
    assert!(should_report(&all, Severity::VERBOSE, Type::VALIDATION));
}

#[test]
fn test_category_filter() {
    // Default filter hides general messages
    let config = config(DebugSeverity::All);
    assert!(should_report(&config, Severity::WARNING, Type::VALIDATION));
    assert!(should_report(&config, Severity::WARNING, Type::PERFORMANCE));
    assert!(!should_report(&config, Severity::WARNING, Type::GENERAL));
}

#[test]
fn test_type_labels() {
    assert_eq!(type_label(Type::VALIDATION | Type::PERFORMANCE), "Validation");
    assert_eq!(type_label(Type::PERFORMANCE), "Performance");
    assert_eq!(type_label(Type::GENERAL), "General");
}

#[test]
fn test_plain_format_marks_repeats() {
    let once = format_plain(Level::Warning, "Validation", 1, "VUID-x", "bad thing");
    assert_eq!(once, "[VULKAN WARNING] [Validation]\n  ├─ Message ID: VUID-x\n  └─ bad thing\n");
    let thrice = format_plain(Level::Error, "General", 3, "id", "msg");
    assert!(thrice.starts_with("[VULKAN ERROR] [General] [×3]"));
}

// ============================================================================
// COUNTERS
// ============================================================================

#[test]
#[serial]
fn test_report_counts_by_severity() {
    init_debug_config(config(DebugSeverity::All));
    assert_eq!(report(Severity::ERROR, Type::VALIDATION, "a", "first"), Some(Level::Error));
    report(Severity::WARNING, Type::VALIDATION, "b", "second");
    report(Severity::WARNING, Type::PERFORMANCE, "c", "third");

    let stats = get_validation_stats();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.warnings, 2);
    assert_eq!(stats.total(), 3);
    cleanup_debug_config();
}

#[test]
#[serial]
fn test_filtered_messages_not_counted() {
    init_debug_config(config(DebugSeverity::ErrorsOnly));
    assert_eq!(report(Severity::WARNING, Type::VALIDATION, "a", "skipped"), None);
    assert_eq!(get_validation_stats().total(), 0);
    cleanup_debug_config();
}

#[test]
#[serial]
fn test_repeated_messages_grouped() {
    init_debug_config(config(DebugSeverity::All));
    assert_eq!(track_message("same"), 1);
    assert_eq!(track_message("same"), 2);
    assert_eq!(track_message("other"), 1);
    cleanup_debug_config();
}

#[test]
#[serial]
fn test_no_reports_after_cleanup() {
    init_debug_config(config(DebugSeverity::All));
    cleanup_debug_config();
    assert_eq!(report(Severity::ERROR, Type::VALIDATION, "a", "late"), None);
    assert_eq!(get_validation_stats().errors, 0);
}

#[test]
#[serial]
fn test_init_resets_counters() {
    init_debug_config(config(DebugSeverity::All));
    report(Severity::ERROR, Type::VALIDATION, "a", "x");
    init_debug_config(config(DebugSeverity::All));
    assert_eq!(get_validation_stats(), ValidationStats::default());
    cleanup_debug_config();
}
