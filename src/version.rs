use chrono::{DateTime, Local};

pub fn version_info() -> String {
    let version = env!("CARGO_PKG_VERSION");
    let build_time = env!("BUILD_TIME");
    let git_commit = env!("GIT_COMMIT_HASH");
    let git_dirty = env!("GIT_DIRTY");

    let build_timestamp: i64 = build_time.parse().unwrap_or(0);
    let build_datetime: DateTime<Local> = DateTime::from_timestamp(build_timestamp, 0)
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now);

    format!(
        "{} {} ({}{}) built {}",
        crate::config::USER_AGENT,
        version,
        git_commit,
        if git_dirty == "dirty" { "-dirty" } else { "" },
        build_datetime.format("%Y-%m-%d %H:%M:%S %Z")
    )
}

/// Value for the SIP `User-Agent` header.
pub fn user_agent() -> String {
    format!(
        "{}/{} ({})",
        crate::config::USER_AGENT,
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_HASH")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_format() {
        let ua = user_agent();
        assert!(ua.starts_with("agentphone/"));
        assert!(version_info().contains(env!("CARGO_PKG_VERSION")));
    }
}
