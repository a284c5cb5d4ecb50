//! Chorus 演示程序
//!
//! 读取配置与角色名册，从标准输入逐行读取用户消息，交给会话编排器处理并打印事件。
//! 使用本地回显后端，不需要 API Key。输入 `/stop` 打断当前轮次，`/quit` 退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use chorus::agent::{AgentStatus, StreamEvent};
use chorus::config::load_config;
use chorus::llm::{InlineToolCallBackend, LlmProfiles, MockLlmClient};
use chorus::memory::{InMemoryMessageStore, Message};
use chorus::persona::{FilePersonaStore, RosterDefaults};
use chorus::runtime::{SessionRouter, SessionServices};
use chorus::tools::{create_default_dispatcher, InMemoryRetriever, Retriever};

const SESSION: &str = "demo";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chorus::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let persona_file = cfg
        .session
        .persona_file
        .clone()
        .unwrap_or_else(|| PathBuf::from("config/personas.toml"));
    let personas = Arc::new(FilePersonaStore::new(&persona_file, RosterDefaults::from(&cfg.session)));

    let retriever = Arc::new(InMemoryRetriever::new());
    retriever
        .add("historian", "chang-an", "长安是唐朝的都城，人口一度超过百万。")
        .await;
    let tools = create_default_dispatcher(
        &cfg.tools,
        Some(retriever as Arc<dyn Retriever>),
        None,
    );

    let llm = LlmProfiles::new(Arc::new(InlineToolCallBackend::new(Arc::new(MockLlmClient))));
    let services = SessionServices::from_config(
        &cfg,
        personas,
        Arc::new(InMemoryMessageStore::new()),
        llm,
        Arc::new(tools),
    );
    let router = Arc::new(SessionRouter::new(services));
    let session = router
        .get_or_start(SESSION)
        .await
        .with_context(|| format!("Failed to start session from {}", persona_file.display()))?;

    println!("chorus demo: type a message, /stop to interrupt, /quit to exit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            _ => {}
        }

        // 事件在后台打印，输入循环保持可用；回复中输入 /stop、结束 等由 submit 转为停止
        let mut events = session.submit(Message::user("user", line)).await?;
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                print_event(&event);
            }
        });
    }

    router.shutdown_all().await;
    Ok(())
}

fn print_event(event: &StreamEvent) {
    match event {
        StreamEvent::AgentStart { persona, .. } => print!("[{persona}] "),
        StreamEvent::AgentChunk { text, .. } => print!("{text}"),
        StreamEvent::AgentEnd { status, .. } => match status {
            AgentStatus::Completed => println!(),
            AgentStatus::Truncated => println!(" …(truncated)"),
            AgentStatus::Cancelled => println!(" …(stopped)"),
            AgentStatus::Errored { reason } => println!(" [error: {reason}]"),
        },
        StreamEvent::SessionStopped { reason } => println!("-- stopped: {reason}"),
    }
}
