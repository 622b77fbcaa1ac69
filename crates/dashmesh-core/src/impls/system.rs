//! Host metadata and tool availability, detected once at startup.

use std::process::Command;

use crate::domain::presence::SystemMetadata;

pub fn detect_system_metadata() -> SystemMetadata {
    let metadata = SystemMetadata {
        os: std::env::consts::OS.to_string(),
        platform: std::env::consts::ARCH.to_string(),
        cpu_cores: sys_info::cpu_num().unwrap_or(0),
        cpu_speed_mhz: sys_info::cpu_speed().unwrap_or(0),
        // sys-info reports kilobytes
        total_memory_bytes: sys_info::mem_info()
            .map(|mem| mem.total.saturating_mul(1024))
            .unwrap_or(0),
        hostname: sys_info::hostname()
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown".into()),
        docker: tool_version("docker").is_some(),
        python: tool_version("python").or_else(|| tool_version("python3")),
        node: tool_version("node"),
        rust: tool_version("rustc"),
    };
    tracing::debug!(
        cores = metadata.cpu_cores,
        docker = metadata.docker,
        python = ?metadata.python,
        "host metadata detected"
    );
    metadata
}

/// `{program} --version`, trimmed. `None` when the program is missing or fails.
fn tool_version(program: &str) -> Option<String> {
    let output = Command::new(program).arg("--version").output().ok()?;
    version_line(output.status.success(), &output.stdout)
}

fn version_line(success: bool, stdout: &[u8]) -> Option<String> {
    if !success {
        return None;
    }
    let version = String::from_utf8(stdout.to_vec()).ok()?;
    let version = version.trim();
    (!version.is_empty()).then(|| version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_line_trims_successful_output() {
        assert_eq!(
            version_line(true, b"Docker version 27.0.3, build 7d4bcd8\n").as_deref(),
            Some("Docker version 27.0.3, build 7d4bcd8")
        );
        assert_eq!(version_line(false, b"v20.11.0\n"), None);
        assert_eq!(version_line(true, b"  \n"), None);
        assert_eq!(version_line(true, &[0xff, 0xfe]), None);
    }

    #[test]
    fn missing_tool_has_no_version() {
        assert_eq!(tool_version("dashmesh-no-such-tool"), None);
    }

    #[test]
    fn detection_never_fails() {
        let meta = detect_system_metadata();
        assert!(!meta.os.is_empty());
        assert!(!meta.hostname.is_empty());
        if cfg!(target_os = "linux") {
            assert!(meta.cpu_cores >= 1);
            assert!(meta.total_memory_bytes > 0);
        }
    }
}
