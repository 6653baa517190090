use std::path::PathBuf;

use anyhow::Result;

use crate::config::{ConfigDir, CRM_TOKEN_FILE};
use crate::crm::CrmClient;
use crate::telemetry;
use crate::telemetry::ops::versions::Phase as VersionsPhase;

/// relay versions — list the API versions on the CRM instance
#[derive(clap::Args)]
pub struct VersionsCmd {
    /// Directory holding crm-config.json and crm-token.json
    pub config_dir: PathBuf,
}

pub async fn run(args: VersionsCmd) -> Result<()> {
    let log = telemetry::versions();
    let _g = log.root_span().entered();

    let crm_cfg = ConfigDir::load_crm_only(&args.config_dir)?;
    let crm = CrmClient::connect(crm_cfg, &args.config_dir.join(CRM_TOKEN_FILE))?;

    let _s = log.span(&VersionsPhase::Fetch).entered();
    let body = crm.api_versions().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
