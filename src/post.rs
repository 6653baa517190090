use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

use crate::chat::{ChatClient, PostOutcome};
use crate::config::ConfigDir;
use crate::format::InboxMessage;
use crate::telemetry;
use crate::telemetry::ops::post::Phase as PostPhase;

/// relay post — manual message posting, for trying out a flow token
#[derive(clap::Args)]
pub struct PostCmd {
    /// Directory holding chat-config.json
    pub config_dir: PathBuf,
    #[command(subcommand)]
    pub cmd: PostSub,
}

#[derive(Subcommand)]
pub enum PostSub {
    /// Post a one-line chat message to a flow
    Chat {
        /// Flow API token to post to
        flow: String,
        content: String,
    },
    /// Post to a team inbox, routed by team name
    Inbox {
        team: String,
        subject: String,
        content: String,
        #[arg(long)]
        project: Option<String>,
    },
}

pub async fn run(args: PostCmd) -> Result<()> {
    let log = telemetry::post();
    let _g = log.root_span().entered();

    let chat_cfg = ConfigDir::load_chat_only(&args.config_dir)?;
    let chat = ChatClient::new(chat_cfg)?;

    let _s = log.span(&PostPhase::Send).entered();
    match args.cmd {
        PostSub::Chat { flow, content } => {
            chat.post_chat(&flow, &content).await?;
            log.info("✅ chat message posted");
        }
        PostSub::Inbox { team, subject, content, project } => {
            let msg = InboxMessage {
                team_name: team,
                subject,
                text_content: content,
                project: project.unwrap_or_default(),
            };
            match chat.post_inbox(&msg).await? {
                PostOutcome::Posted => log.info("✅ inbox message posted"),
                PostOutcome::Dropped => log.warn("team has no flow and no default is configured"),
            }
        }
    }
    Ok(())
}
