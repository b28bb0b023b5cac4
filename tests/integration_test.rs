use tracekit::error::{AttachFailure, Result, TracekitError};

#[test]
fn test_error_types() {
    let err = TracekitError::Attach {
        entry_point: "xdp_drop".to_string(),
        target: "eth9".to_string(),
        kind: AttachFailure::InterfaceNotFound,
        reason: "unknown network interface eth9".to_string(),
    };

    let message = err.to_string();
    assert!(message.contains("xdp_drop"));
    assert!(message.contains("eth9"));
    assert!(message.contains("interface not found"));
}

#[test]
fn test_symbol_not_found_names_both_symbols() {
    let err = TracekitError::SymbolNotFound {
        primary: "sys_chroot".to_string(),
        fallback: Some("__x64_sys_chroot".to_string()),
    };
    assert_eq!(
        err.to_string(),
        "Kernel symbol sys_chroot not found (fallback __x64_sys_chroot not found either)"
    );

    let err = TracekitError::SymbolNotFound {
        primary: "tcp_v4_connect".to_string(),
        fallback: None,
    };
    assert!(err.to_string().ends_with("and no fallback is declared"));
}

#[test]
fn test_result_alias() {
    fn table() -> Result<u64> {
        Err(TracekitError::Table {
            table: "dropcnt".to_string(),
            reason: "value is 4 bytes, expected 8".to_string(),
        })
    }
    assert!(table().unwrap_err().to_string().contains("dropcnt"));
}

#[test]
fn test_version_const() {
    assert!(!tracekit::VERSION.is_empty());
}
