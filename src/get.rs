use std::path::PathBuf;

use anyhow::Result;

use crate::config::{ConfigDir, CRM_TOKEN_FILE};
use crate::crm::CrmClient;
use crate::telemetry;
use crate::telemetry::ops::get::Phase as GetPhase;

/// relay get — print JSON from a CRM URL, for exploring the API
#[derive(clap::Args)]
pub struct GetCmd {
    /// Directory holding crm-config.json and crm-token.json
    pub config_dir: PathBuf,
    /// URL to GET JSON from; a relative URL resolves against the API root.
    /// Pass an empty string '' to start exploring from the root.
    pub url: String,
}

pub async fn run(args: GetCmd) -> Result<()> {
    let log = telemetry::get();
    let _g = log.root_span_kv([("url", args.url.clone())]).entered();

    let crm_cfg = ConfigDir::load_crm_only(&args.config_dir)?;
    let crm = CrmClient::connect(crm_cfg, &args.config_dir.join(CRM_TOKEN_FILE))?;

    let _s = log.span(&GetPhase::Fetch).entered();
    let body = crm.get_json(&args.url).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
