//! 域名列表加载
//!
//! 合并 `general` 中的内联条目与列表文件，生成所有 sink 共享的 `DomainFilter`。

use std::path::Path;

use contracts::{ContractError, DomainFilter, DomainList, GeneralConfig};
use tracing::debug;

/// Build the shared filter from inline entries and list files
///
/// Relative file paths resolve against `base_dir` (the config file's
/// directory) when given.
pub fn load_domain_filter(
    general: &GeneralConfig,
    base_dir: Option<&Path>,
) -> Result<DomainFilter, ContractError> {
    let skip = load_list(&general.skip_domains, general.skip_domains_file.as_deref(), base_dir)?;
    let allow = load_list(&general.allow_domains, general.allow_domains_file.as_deref(), base_dir)?;
    debug!(skip = skip.len(), allow = allow.len(), "domain lists loaded");
    Ok(DomainFilter::new(skip, allow))
}

fn load_list(
    inline: &[String],
    file: Option<&Path>,
    base_dir: Option<&Path>,
) -> Result<DomainList, ContractError> {
    let mut list = DomainList::from_entries(inline)?;
    if let Some(file) = file {
        let path = match base_dir {
            Some(dir) if file.is_relative() => dir.join(file),
            _ => file.to_path_buf(),
        };
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ContractError::domain_list(path.display().to_string(), 0, e.to_string()))?;
        list.extend(DomainList::parse(&path.display().to_string(), &content)?);
    }
    Ok(list)
}
