use std::{io::Write, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{pin_mut, StreamExt};

use chatlist_core_sdk::{
    config::AppConfig,
    credentials::CredentialStore,
    db::{self, Connection},
    dispatch::{DispatchOutcome, Dispatcher},
    export::{self, ExportDocument, ExportEntry, ExportFormat},
    improver::PromptImprover,
    llm::ProviderFamily,
    models::{ModelConfig, ModelPatch, NewModel},
    server::{self, AppState},
    telemetry,
};

/**
 * \brief CLI 程序入口：同一提示词并发发送给多个模型并比较回复。
 */
#[derive(Parser, Debug)]
#[command(name = "chatlist", version, about = "Send one prompt to many LLMs and compare the answers")]
struct Cli {
    /// Write telemetry lines to the log directory for this run
    #[arg(long, global = true, default_value_t = false)]
    telemetry: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage model configurations
    Models {
        #[command(subcommand)]
        action: ModelCommand,
    },

    /// Manage saved prompts
    Prompts {
        #[command(subcommand)]
        action: PromptCommand,
    },

    /**
     * \brief 并发发送提示词，按完成顺序打印每个模型的结果。
     */
    Send {
        #[arg(long)]
        prompt: String,
        /// Model name; repeat for several. Defaults to all active models
        #[arg(long = "model")]
        models: Vec<String>,
        /// Save the prompt and every successful response
        #[arg(long, default_value_t = false)]
        save: bool,
        #[arg(long)]
        tags: Option<String>,
        /// markdown | json
        #[arg(long)]
        export: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Browse saved results
    Results {
        #[command(subcommand)]
        action: ResultCommand,
    },

    /**
     * \brief 改写提示词，可选同时生成三种适配版本。
     */
    Improve {
        #[arg(long)]
        prompt: String,
        /// Model name; defaults to the improver_model_id setting
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = false)]
        adapt: bool,
        /// Also ask for up to three paraphrases
        #[arg(long, default_value_t = false)]
        reformulate: bool,
        /// Save the improved prompt as a new prompt record
        #[arg(long, default_value_t = false)]
        save: bool,
    },

    /// Read and write persisted settings
    Settings {
        #[command(subcommand)]
        action: SettingCommand,
    },

    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum ModelCommand {
    Add {
        #[arg(long)]
        name: String,
        /// Endpoint; defaults to the family's endpoint
        #[arg(long)]
        url: Option<String>,
        /// Name of the environment variable holding the API key
        #[arg(long = "key-env")]
        key_env: String,
        #[arg(long = "type", default_value = "openrouter")]
        model_type: String,
        #[arg(long, default_value_t = false)]
        inactive: bool,
    },
    List {
        #[arg(long, default_value_t = false)]
        active: bool,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long, default_value = "ASC")]
        order: String,
    },
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long = "key-env")]
        key_env: Option<String>,
        #[arg(long = "type")]
        model_type: Option<String>,
        #[arg(long)]
        active: Option<bool>,
    },
    Toggle {
        id: i64,
    },
    Remove {
        id: i64,
    },
    Search {
        query: String,
    },
}

#[derive(Subcommand, Debug)]
enum PromptCommand {
    Save {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        tags: Option<String>,
    },
    List {
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long, default_value = "DESC")]
        order: String,
    },
    Search {
        query: String,
        #[arg(long)]
        limit: Option<i64>,
    },
    Remove {
        id: i64,
    },
}

#[derive(Subcommand, Debug)]
enum ResultCommand {
    List {
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long = "prompt-id")]
        prompt_id: Option<i64>,
        #[arg(long = "model-id")]
        model_id: Option<i64>,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long, default_value = "DESC")]
        order: String,
    },
    Search {
        query: String,
        #[arg(long)]
        limit: Option<i64>,
    },
    Remove {
        id: i64,
    },
    /// Export the saved results of one prompt
    Export {
        #[arg(long = "prompt-id")]
        prompt_id: i64,
        #[arg(long, default_value = "markdown")]
        format: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum SettingCommand {
    Get { key: String },
    Set { key: String, value: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    telemetry::set_log_dir(config.log_dir.clone());

    let conn = db::open_db(&config.db_path).context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = cli.telemetry || db::get_telemetry_enabled(&conn).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    match cli.command {
        Commands::Models { action } => run_models(&conn, action)?,
        Commands::Prompts { action } => run_prompts(&conn, action)?,
        Commands::Results { action } => run_results(&conn, action)?,
        Commands::Settings { action } => run_settings(&conn, action)?,
        Commands::Send {
            prompt,
            models,
            save,
            tags,
            export: export_format,
            out,
        } => {
            let format = export_format
                .as_deref()
                .map(str::parse::<ExportFormat>)
                .transpose()?;
            if format.is_some() && out.is_none() {
                bail!("--export requires --out FILE");
            }
            let configs = resolve_models(&conn, &models)?;
            let dispatcher = build_dispatcher(&conn, &config)?;
            telemetry::log_event(
                "cli.send",
                &format!("models={} prompt_len={} save={}", configs.len(), prompt.len(), save),
            );

            let outcomes = send_round(&dispatcher, &prompt, &configs).await;

            if save {
                let prompt_id = db::add_prompt(&conn, &prompt, tags.as_deref())
                    .context("save prompt failed")?;
                let ids = db::save_outcomes(&conn, prompt_id, &outcomes)
                    .context("save results failed")?;
                println!("Saved prompt id={} with {} result(s)", prompt_id, ids.len());
            }
            if let (Some(format), Some(out)) = (format, out) {
                let doc = ExportDocument::from_outcomes(&prompt, &outcomes);
                export::write_to(&out, &doc, format)?;
                println!("Exported {} result(s) to {}", doc.results.len(), out.display());
            }
        }
        Commands::Improve {
            prompt,
            model,
            adapt,
            reformulate,
            save,
        } => {
            let model = resolve_improver_model(&conn, model.as_deref())?;
            let improver = PromptImprover::new(build_dispatcher(&conn, &config)?);
            telemetry::log_event(
                "cli.improve",
                &format!("model={} adapt={} prompt_len={}", model.name, adapt, prompt.len()),
            );

            let improvement = improver
                .improve(&prompt, &model)
                .await
                .context("improve failed")?;
            println!("Improved prompt:\n{}\n", improvement.result.improved);
            for (i, alt) in improvement.result.alternatives.iter().enumerate() {
                println!("Alternative {}:\n{}\n", i + 1, alt);
            }

            if reformulate {
                let variants = improver.reformulate(&prompt, &model).await?;
                for (i, v) in variants.iter().enumerate() {
                    println!("Paraphrase {}:\n{}\n", i + 1, v);
                }
            }
            if adapt {
                let adaptations = improver.adaptations(&prompt, &model).await?;
                println!("For code:\n{}\n", adaptations.code);
                println!("For analysis:\n{}\n", adaptations.analysis);
                println!("For creative work:\n{}\n", adaptations.creative);
            }
            if save {
                let id = db::add_prompt(&conn, &improvement.result.improved, None)
                    .context("save improved prompt failed")?;
                println!("Saved improved prompt id={}", id);
            }
        }
        Commands::Serve { addr } => {
            let dispatcher = build_dispatcher(&conn, &config)?;
            drop(conn);
            let state = AppState::new(dispatcher, config.db_path.clone());
            server::run(&addr, state, config.ui_dir.clone()).await?;
        }
    }

    Ok(())
}

/**
 * \brief 加载凭据并构建分发器；持久化的超时设置优先。
 */
fn build_dispatcher(conn: &Connection, config: &AppConfig) -> Result<Dispatcher> {
    let credentials = CredentialStore::load(&config.env_file, &config.env_local_file)
        .context("load credentials failed")?;
    let timeout = db::get_request_timeout_secs(conn)?
        .map(Duration::from_secs)
        .unwrap_or(config.request_timeout);
    Dispatcher::with_timeout(Arc::new(credentials), timeout).context("build http client failed")
}

/**
 * \brief 按名称解析模型；未指定时取全部启用模型。
 */
fn resolve_models(conn: &Connection, names: &[String]) -> Result<Vec<ModelConfig>> {
    if names.is_empty() {
        let active = db::list_active_models(conn)?;
        if active.is_empty() {
            bail!("no active models, add one with: chatlist models add ...");
        }
        return Ok(active);
    }
    names
        .iter()
        .map(|name| {
            db::get_model_by_name(conn, name)?.with_context(|| format!("unknown model: {}", name))
        })
        .collect()
}

fn resolve_improver_model(conn: &Connection, name: Option<&str>) -> Result<ModelConfig> {
    if let Some(name) = name {
        return db::get_model_by_name(conn, name)?.with_context(|| format!("unknown model: {}", name));
    }
    let id = db::get_improver_model_id(conn)?
        .context("no --model given and improver_model_id is not set")?;
    db::get_model(conn, id)?.with_context(|| format!("improver model id {} not found", id))
}

/**
 * \brief 按完成顺序打印结果，返回与输入顺序一致的结果列表。
 */
async fn send_round(
    dispatcher: &Dispatcher,
    prompt: &str,
    configs: &[ModelConfig],
) -> Vec<DispatchOutcome> {
    let total = configs.len();
    let mut slots: Vec<Option<DispatchOutcome>> = configs.iter().map(|_| None).collect();
    let stream = dispatcher.dispatch_stream(prompt, configs);
    pin_mut!(stream);
    let mut done = 0;
    while let Some((index, outcome)) = stream.next().await {
        done += 1;
        print_outcome(done, total, &outcome);
        slots[index] = Some(outcome);
    }
    slots.into_iter().flatten().collect()
}

fn print_outcome(done: usize, total: usize, outcome: &DispatchOutcome) {
    println!("[{}/{}] {}", done, total, outcome.model_name);
    match outcome.reply() {
        Some(reply) => {
            println!("{}", reply.response);
            println!(
                "  ({} tokens, {:.2}s, {})",
                reply.metadata.tokens_used, reply.metadata.response_time, reply.metadata.api_type
            );
        }
        None => println!("{}", outcome.display_text()),
    }
    println!();
    std::io::stdout().flush().ok();
}

fn print_models(models: &[ModelConfig]) {
    if models.is_empty() {
        println!("No models.");
        return;
    }
    for m in models {
        println!(
            "{:>4}  {:<6} {:<10} {:<32} key={} url={}",
            m.id,
            if m.is_active { "on" } else { "off" },
            m.family.tag(),
            m.name,
            m.api_id,
            m.api_url
        );
    }
}

fn run_models(conn: &Connection, action: ModelCommand) -> Result<()> {
    match action {
        ModelCommand::Add {
            name,
            url,
            key_env,
            model_type,
            inactive,
        } => {
            let api_url = match url {
                Some(url) => url,
                None => ProviderFamily::parse(&model_type)
                    .and_then(|f| f.profile().default_endpoint)
                    .map(str::to_string)
                    .unwrap_or_default(),
            };
            let input = NewModel {
                name,
                api_url,
                api_id: key_env,
                model_type,
                is_active: !inactive,
            };
            let id = db::add_model(conn, &input).context("add model failed")?;
            telemetry::log_event("cli.models", &format!("add id={} name={}", id, input.name));
            println!("Added model id={} ({})", id, input.name);
        }
        ModelCommand::List {
            active,
            sort,
            order,
        } => {
            let models = if active {
                db::list_active_models(conn)?
            } else if let Some(field) = sort {
                db::sort_models(conn, &field, &order)?
            } else {
                db::list_models(conn)?
            };
            print_models(&models);
        }
        ModelCommand::Update {
            id,
            name,
            url,
            key_env,
            model_type,
            active,
        } => {
            let patch = ModelPatch {
                name,
                api_url: url,
                api_id: key_env,
                model_type,
                is_active: active,
            };
            if db::update_model(conn, id, &patch).context("update model failed")? {
                println!("Updated model id={}", id);
            } else {
                println!("Nothing to update");
            }
        }
        ModelCommand::Toggle { id } => {
            let active = db::toggle_model(conn, id)?;
            println!("Model id={} is now {}", id, if active { "active" } else { "inactive" });
        }
        ModelCommand::Remove { id } => {
            db::delete_model(conn, id)?;
            telemetry::log_event("cli.models", &format!("remove id={}", id));
            println!("Removed model id={}", id);
        }
        ModelCommand::Search { query } => print_models(&db::search_models(conn, &query)?),
    }
    Ok(())
}

fn run_prompts(conn: &Connection, action: PromptCommand) -> Result<()> {
    let print = |prompts: Vec<chatlist_core_sdk::models::PromptRecord>| {
        if prompts.is_empty() {
            println!("No prompts.");
        }
        for p in prompts {
            println!(
                "{:>4}  {}  [{}]  {}",
                p.id,
                p.date,
                p.tags.as_deref().unwrap_or(""),
                p.prompt.replace('\n', " ")
            );
        }
    };
    match action {
        PromptCommand::Save { prompt, tags } => {
            let id = db::add_prompt(conn, &prompt, tags.as_deref())?;
            println!("Saved prompt id={}", id);
        }
        PromptCommand::List {
            limit,
            offset,
            sort,
            order,
        } => match sort {
            Some(field) => print(db::sort_prompts(conn, &field, &order)?),
            None => print(db::list_prompts(conn, limit, offset)?),
        },
        PromptCommand::Search { query, limit } => print(db::search_prompts(conn, &query, limit)?),
        PromptCommand::Remove { id } => {
            if db::delete_prompt(conn, id)? {
                println!("Removed prompt id={} and its results", id);
            } else {
                println!("Prompt id={} not found", id);
            }
        }
    }
    Ok(())
}

fn run_results(conn: &Connection, action: ResultCommand) -> Result<()> {
    let print = |results: Vec<chatlist_core_sdk::models::StoredResult>| {
        if results.is_empty() {
            println!("No results.");
        }
        for r in results {
            println!(
                "{:>4}  {}  {}  prompt={}",
                r.id,
                r.saved_at,
                r.model_name.as_deref().unwrap_or("?"),
                r.prompt.as_deref().unwrap_or("").replace('\n', " ")
            );
            println!("      {}", r.response.replace('\n', "\n      "));
        }
    };
    match action {
        ResultCommand::List {
            limit,
            offset,
            prompt_id,
            model_id,
            sort,
            order,
        } => {
            let results = match (prompt_id, model_id, sort) {
                (Some(pid), _, _) => db::results_for_prompt(conn, pid)?,
                (None, Some(mid), _) => db::results_for_model(conn, mid)?,
                (None, None, Some(field)) => db::sort_results(conn, &field, &order)?,
                (None, None, None) => db::list_results(conn, limit, offset)?,
            };
            print(results);
        }
        ResultCommand::Search { query, limit } => print(db::search_results(conn, &query, limit)?),
        ResultCommand::Remove { id } => {
            if db::delete_result(conn, id)? {
                println!("Removed result id={}", id);
            } else {
                println!("Result id={} not found", id);
            }
        }
        ResultCommand::Export {
            prompt_id,
            format,
            out,
        } => {
            let format: ExportFormat = format.parse()?;
            let prompt = db::get_prompt(conn, prompt_id)?
                .with_context(|| format!("prompt id {} not found", prompt_id))?;
            let results = db::results_for_prompt(conn, prompt_id)?;
            if results.is_empty() {
                bail!("prompt id {} has no saved results", prompt_id);
            }
            let doc = ExportDocument {
                prompt: prompt.prompt,
                results: results.iter().map(ExportEntry::from_stored).collect(),
            };
            export::write_to(&out, &doc, format)?;
            println!("Exported {} result(s) to {}", doc.results.len(), out.display());
        }
    }
    Ok(())
}

fn run_settings(conn: &Connection, action: SettingCommand) -> Result<()> {
    match action {
        SettingCommand::Get { key } => match db::get_setting(conn, &key)? {
            Some(value) => println!("{}={}", key, value),
            None => println!("{} is not set", key),
        },
        SettingCommand::Set { key, value } => {
            match key.as_str() {
                "telemetry_enabled" => {
                    let enabled = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes");
                    db::set_telemetry_enabled(conn, enabled)?;
                }
                "request_timeout_secs" => {
                    let secs: u64 = value.trim().parse().context("timeout must be a number of seconds")?;
                    db::set_request_timeout_secs(conn, secs)?;
                }
                "improver_model_id" => {
                    let id = match value.trim().parse::<i64>() {
                        Ok(id) => id,
                        Err(_) => {
                            db::get_model_by_name(conn, value.trim())?
                                .with_context(|| format!("unknown model: {}", value))?
                                .id
                        }
                    };
                    db::set_improver_model_id(conn, id)?;
                }
                _ => db::set_setting(conn, &key, &value)?,
            }
            println!("Saved {}", key);
        }
        SettingCommand::List => {
            for (key, value) in db::all_settings(conn)? {
                println!("{}={}", key, value);
            }
        }
    }
    Ok(())
}
