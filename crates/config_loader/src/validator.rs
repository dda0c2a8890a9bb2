//! 配置校验模块
//!
//! 校验规则：
//! - 至少一个 capture，device 非空
//! - fast_ring: block_size 为页大小整数倍，block_count >= 1
//! - sink name 非空且唯一
//! - queue_capacity >= 1
//! - sql sink: endpoint 必填，workers / batch_size >= 1
//! - output_mode 需要的 skip/allow 列表必须存在

use std::collections::HashSet;

use contracts::{
    CaptureMode, ContractError, GeneralConfig, MonitorBlueprint, OutputMode, SinkConfig, SinkType,
    SQL_MAX_BATCH_SIZE,
};

const PAGE_SIZE: u32 = 4096;

/// 校验 MonitorBlueprint 配置
///
/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(blueprint: &MonitorBlueprint) -> Result<(), ContractError> {
    validate_general(&blueprint.general)?;
    validate_captures(blueprint)?;
    validate_sink_names(blueprint)?;
    for (idx, sink) in blueprint.sinks.iter().enumerate() {
        validate_sink(idx, sink, &blueprint.general)?;
    }
    Ok(())
}

fn validate_general(general: &GeneralConfig) -> Result<(), ContractError> {
    if general.result_queue_capacity == 0 {
        return Err(ContractError::config_validation(
            "general.result_queue_capacity",
            "must be >= 1",
        ));
    }
    if general.stats_interval_ms == 0 {
        return Err(ContractError::config_validation(
            "general.stats_interval_ms",
            "must be > 0",
        ));
    }
    Ok(())
}

/// 校验 capture 配置
fn validate_captures(blueprint: &MonitorBlueprint) -> Result<(), ContractError> {
    if blueprint.captures.is_empty() {
        return Err(ContractError::config_validation(
            "captures",
            "at least one capture device is required",
        ));
    }
    for (idx, capture) in blueprint.captures.iter().enumerate() {
        if capture.device.trim().is_empty() {
            return Err(ContractError::config_validation(
                format!("captures[{idx}].device"),
                "device name cannot be empty",
            ));
        }
        if capture.snap_len == 0 {
            return Err(ContractError::config_validation(
                format!("captures[{}].snap_len", capture.device),
                "snap_len must be > 0",
            ));
        }
        if capture.mode == CaptureMode::FastRing {
            if capture.block_size == 0 || capture.block_size % PAGE_SIZE != 0 {
                return Err(ContractError::config_validation(
                    format!("captures[{}].block_size", capture.device),
                    format!(
                        "block_size must be a non-zero multiple of {PAGE_SIZE}, got {}",
                        capture.block_size
                    ),
                ));
            }
            if capture.block_count == 0 {
                return Err(ContractError::config_validation(
                    format!("captures[{}].block_count", capture.device),
                    "block_count must be >= 1",
                ));
            }
        }
    }
    Ok(())
}

/// 校验 sink name 唯一性
fn validate_sink_names(blueprint: &MonitorBlueprint) -> Result<(), ContractError> {
    let mut seen = HashSet::new();
    for (idx, sink) in blueprint.sinks.iter().enumerate() {
        if sink.name.trim().is_empty() {
            return Err(ContractError::config_validation(
                format!("sinks[{idx}].name"),
                "sink name cannot be empty",
            ));
        }
        if !seen.insert(sink.name.as_str()) {
            return Err(ContractError::config_validation(
                format!("sinks[name={}]", sink.name),
                "duplicate sink name",
            ));
        }
    }
    Ok(())
}

/// 校验单个 sink
fn validate_sink(idx: usize, sink: &SinkConfig, general: &GeneralConfig) -> Result<(), ContractError> {
    if sink.queue_capacity == Some(0) {
        return Err(ContractError::config_validation(
            format!("sinks[{idx}].queue_capacity"),
            "queue_capacity must be >= 1",
        ));
    }

    // disabled sinks are dropped at startup, their params are not checked
    if !sink.output_mode.is_enabled() {
        return Ok(());
    }

    if sink.output_mode.uses_skip_list() && !general.has_skip_list() {
        return Err(ContractError::config_validation(
            format!("sinks[{}].output_mode", sink.name),
            format!("mode '{}' requires a skip list", sink.output_mode),
        ));
    }
    if sink.output_mode.uses_allow_list() && !general.has_allow_list() {
        return Err(ContractError::config_validation(
            format!("sinks[{}].output_mode", sink.name),
            format!("mode '{}' requires an allow list", sink.output_mode),
        ));
    }

    for key in ["workers", "batch_size"] {
        positive_param(sink, key)?;
    }
    if sink.sink_type == SinkType::Sql {
        let endpoint = sink.params.get("endpoint").map(|s| s.trim()).unwrap_or_default();
        if endpoint.is_empty() {
            return Err(ContractError::config_validation(
                format!("sinks[{}].params.endpoint", sink.name),
                "sql sink requires an endpoint",
            ));
        }
        if let Some(Ok(n)) = sink.params.get("batch_size").map(|raw| raw.trim().parse::<usize>()) {
            if n > SQL_MAX_BATCH_SIZE {
                return Err(ContractError::config_validation(
                    format!("sinks[{}].params.batch_size", sink.name),
                    format!(
                        "batch_size {n} exceeds {SQL_MAX_BATCH_SIZE}, the most rows one INSERT can bind"
                    ),
                ));
            }
        }
        for key in ["batch_delay_ms", "batch_timeout_ms"] {
            if let Some(raw) = sink.params.get(key) {
                raw.trim().parse::<u64>().map_err(|_| {
                    ContractError::config_validation(
                        format!("sinks[{}].params.{key}", sink.name),
                        format!("expected milliseconds, got '{raw}'"),
                    )
                })?;
            }
        }
        if let Some(raw) = sink.params.get("save_full_query") {
            raw.trim().parse::<bool>().map_err(|_| {
                ContractError::config_validation(
                    format!("sinks[{}].params.save_full_query", sink.name),
                    format!("expected true or false, got '{raw}'"),
                )
            })?;
        }
    }
    Ok(())
}

fn positive_param(sink: &SinkConfig, key: &str) -> Result<(), ContractError> {
    let Some(raw) = sink.params.get(key) else {
        return Ok(());
    };
    match raw.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(()),
        _ => Err(ContractError::config_validation(
            format!("sinks[{}].params.{key}", sink.name),
            format!("{key} must be an integer >= 1, got '{raw}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{CaptureConfig, ConfigVersion};
    use std::collections::HashMap;

    fn minimal_blueprint() -> MonitorBlueprint {
        let mut params = HashMap::new();
        params.insert("endpoint".to_string(), "mysql://dns@127.0.0.1/dns".to_string());
        params.insert("batch_size".to_string(), "100".to_string());
        MonitorBlueprint {
            version: ConfigVersion::V1,
            general: GeneralConfig {
                skip_domains: vec!["ads.example.com".into()],
                ..Default::default()
            },
            captures: vec![CaptureConfig::new("eth0")],
            sinks: vec![SinkConfig {
                name: "db".into(),
                sink_type: SinkType::Sql,
                output_mode: OutputMode::SkipList,
                queue_capacity: Some(1000),
                params,
            }],
        }
    }

    fn err_of(bp: &MonitorBlueprint) -> String {
        validate(bp).unwrap_err().to_string()
    }

    #[test]
    fn test_valid_config() {
        let bp = minimal_blueprint();
        assert!(validate(&bp).is_ok());
    }

    #[test]
    fn test_no_captures() {
        let mut bp = minimal_blueprint();
        bp.captures.clear();
        assert!(err_of(&bp).contains("at least one capture"));
    }

    #[test]
    fn test_empty_device() {
        let mut bp = minimal_blueprint();
        bp.captures[0].device = " ".into();
        assert!(err_of(&bp).contains("device name cannot be empty"));
    }

    #[test]
    fn test_fast_ring_geometry() {
        let mut bp = minimal_blueprint();
        bp.captures[0].mode = CaptureMode::FastRing;
        bp.captures[0].block_size = 5000;
        assert!(err_of(&bp).contains("multiple of 4096"));

        bp.captures[0].block_size = 8192;
        bp.captures[0].block_count = 0;
        assert!(err_of(&bp).contains("block_count"));

        // live capture ignores ring geometry
        bp.captures[0].mode = CaptureMode::Live;
        assert!(validate(&bp).is_ok());
    }

    #[test]
    fn test_duplicate_sink_name() {
        let mut bp = minimal_blueprint();
        bp.sinks.push(bp.sinks[0].clone());
        let err = err_of(&bp);
        assert!(err.contains("duplicate sink name"), "got: {err}");
    }

    #[test]
    fn test_empty_sink_name() {
        let mut bp = minimal_blueprint();
        bp.sinks[0].name = String::new();
        let err = err_of(&bp);
        assert!(err.contains("cannot be empty"), "got: {err}");
    }

    #[test]
    fn test_zero_batch_size_and_workers() {
        let mut bp = minimal_blueprint();
        bp.sinks[0].params.insert("batch_size".into(), "0".into());
        assert!(err_of(&bp).contains("batch_size must be an integer >= 1"));

        let mut bp = minimal_blueprint();
        bp.sinks[0].params.insert("workers".into(), "-2".into());
        assert!(err_of(&bp).contains("workers must be"));
    }

    #[test]
    fn test_sql_batch_size_upper_bound() {
        let mut bp = minimal_blueprint();
        bp.sinks[0].params.insert("batch_size".into(), "3855".into());
        assert!(validate(&bp).is_ok());

        bp.sinks[0].params.insert("batch_size".into(), "4000".into());
        assert!(err_of(&bp).contains("exceeds 3855"));

        // log sinks have no placeholder limit
        bp.sinks[0].sink_type = SinkType::Log;
        assert!(validate(&bp).is_ok());
    }

    #[test]
    fn test_zero_queue_capacity() {
        let mut bp = minimal_blueprint();
        bp.sinks[0].queue_capacity = Some(0);
        assert!(err_of(&bp).contains("queue_capacity"));
    }

    #[test]
    fn test_mode_requires_lists() {
        let mut bp = minimal_blueprint();
        bp.general.skip_domains.clear();
        assert!(err_of(&bp).contains("requires a skip list"));

        let mut bp = minimal_blueprint();
        bp.sinks[0].output_mode = OutputMode::Both;
        assert!(err_of(&bp).contains("requires an allow list"));

        bp.general.allow_domains_file = Some("allow.csv".into());
        assert!(validate(&bp).is_ok());
    }

    #[test]
    fn test_sql_endpoint_required() {
        let mut bp = minimal_blueprint();
        bp.sinks[0].params.remove("endpoint");
        assert!(err_of(&bp).contains("requires an endpoint"));

        // unless the sink is disabled
        bp.sinks[0].output_mode = OutputMode::Disabled;
        assert!(validate(&bp).is_ok());
    }

    #[test]
    fn test_bad_delay() {
        let mut bp = minimal_blueprint();
        bp.sinks[0].params.insert("batch_delay_ms".into(), "soon".into());
        assert!(err_of(&bp).contains("expected milliseconds"));
    }
}
