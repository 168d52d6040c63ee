//! Interactive console acting as the host participant.

use crate::engine::{
    DirectionSetting, Engine, ExtensionMode, ObjectKind, ParamId, ParallelSide, Participant,
    ProcessorId,
};
use anyhow::Result;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::Arc;

/// Run the REPL until `exit` or EOF.
pub async fn run_repl(engine: Arc<Engine>) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    println!("{}", "spatial-gw console — 'help' lists commands".dimmed());

    loop {
        match rl.readline("gw> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);
                if line == "exit" || line == "quit" {
                    break;
                }
                if let Err(e) = dispatch(&engine, line).await {
                    eprintln!("{} {e:#}", "error:".red());
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

async fn dispatch(engine: &Arc<Engine>, line: &str) -> Result<()> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    match parts.as_slice() {
        ["help"] => print_help(),
        ["status"] => print_status(engine),
        ["list"] => print_list(engine),

        ["create", kind] => {
            let kind = parse_kind(kind)?;
            let id = engine.create_object(kind).await;
            println!("created {} with id {}", kind.label(), id.to_string().green());
        }
        ["remove", ids @ ..] if !ids.is_empty() => {
            let ids = parse_ids(ids)?;
            if ids.len() == 1 {
                if engine.remove_object(ids[0]).await {
                    println!("removed {}", ids[0]);
                } else {
                    println!("no object with id {}", ids[0]);
                }
            } else {
                let removed = engine.remove_batch(&ids).await;
                println!("removed {removed} of {} objects", ids.len());
            }
        }

        ["set", id, param, value] => {
            let id: ProcessorId = id.parse()?;
            let param = parse_param(param)?;
            let value: f32 = value.parse()?;
            if engine.set_parameter(id, param, value, Participant::Host).await {
                println!("ok");
            } else {
                println!("unchanged (unknown id or same value)");
            }
        }
        ["id", id, object_id] => {
            let id: ProcessorId = id.parse()?;
            let object_id: u16 = object_id.parse()?;
            engine.set_object_id(id, object_id, Participant::Host).await;
            println!("ok");
        }
        ["map", id, mapping] => {
            let id: ProcessorId = id.parse()?;
            let mapping: u8 = mapping.parse()?;
            engine.set_mapping_id(id, mapping, Participant::Host).await;
            println!("ok");
        }
        ["name", id, rest @ ..] if !rest.is_empty() => {
            let id: ProcessorId = id.parse()?;
            engine
                .set_name(id, &rest.join(" "), Participant::Host)
                .await;
            println!("ok");
        }
        ["dir", id, setting] => {
            let id: ProcessorId = id.parse()?;
            let setting = parse_direction(setting)?;
            engine
                .set_direction(id, setting.to_mode(), Participant::Host)
                .await;
            println!("ok");
        }

        ["mode", mode] => {
            engine.set_extension_mode(parse_mode(mode)?).await;
            println!("ok");
        }
        ["side", side] => {
            engine.set_parallel_side(parse_side(side)?).await;
            println!("ok");
        }
        ["rate", ms] => {
            engine.set_tick_interval_ms(ms.parse()?).await;
            println!("dispatch interval now {} ms", engine.status().tick_ms);
        }
        ["online", flag] => {
            engine.set_online(matches!(*flag, "on" | "true" | "1")).await;
            println!("ok");
        }

        ["select", id, flag] => {
            let id: ProcessorId = id.parse()?;
            engine
                .selection()
                .set_selected(id, matches!(*flag, "on" | "true" | "1"));
            println!("ok");
        }
        ["groups"] => {
            let ids = engine.selection().group_ids();
            if ids.is_empty() {
                println!("no selection groups defined");
            } else {
                println!(
                    "groups: {}",
                    ids.iter().map(u16::to_string).collect::<Vec<_>>().join(", ")
                );
            }
        }

        ["save"] => {
            engine.save_now().await?;
            println!("snapshot saved at {}", chrono::Local::now().format("%H:%M:%S"));
        }
        ["restore"] => {
            if engine.restore_latest().await? {
                println!("snapshot restored");
            } else {
                println!("no snapshot available");
            }
        }

        _ => println!("unknown command, try 'help'"),
    }

    Ok(())
}

fn print_help() {
    println!(
        "{}",
        r#"commands:
  status                     engine and topology overview
  list                       all objects with values
  create <sound|in|out>      create an object
  remove <id> [id...]        remove one object or a batch
  set <id> <param> <value>   set a parameter (x y reverb spread delay gain mute)
  id <id> <object_id>        set the device-facing object number
  map <id> <mapping>         set the coordinate mapping area
  name <id> <text>           label an object
  dir <id> <none|rx|tx|both> set the sync direction
  mode <off|extend|mirror|parallel>
  side <first|second|none>   active side for parallel mode
  rate <ms>                  dispatch interval (clamped 20..5000)
  online <on|off>            polling enablement
  select <id> <on|off>       select or deselect an object
  groups                     list selection group ids
  save / restore             snapshot persistence
  exit"#
            .dimmed()
    );
}

fn print_status(engine: &Arc<Engine>) {
    let s = engine.status();
    println!(
        "objects: {} sound / {} in / {} out",
        s.sound_objects.to_string().green(),
        s.matrix_inputs.to_string().green(),
        s.matrix_outputs.to_string().green()
    );
    println!(
        "mode: {}  side: {:?}  master: {}",
        s.mode.label().cyan(),
        s.active_side,
        if s.first_is_master { "first" } else { "second" }
    );
    println!(
        "tick: {} ms  online: {}  tab: {}  saves: {}",
        s.tick_ms,
        if s.online { "yes".green() } else { "no".red() },
        s.remote_tab,
        s.saves_scheduled
    );
}

fn print_list(engine: &Arc<Engine>) {
    let views = engine.object_views();
    if views.is_empty() {
        println!("no objects");
        return;
    }
    let selection = engine.selection();
    for v in views {
        let marker = if selection.is_selected(v.id) { "*" } else { " " };
        let values = v
            .values
            .iter()
            .map(|(p, val)| format!("{p:?}={val:.2}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{marker}{:>3}  {:<13} obj={:<3} map={} dir={:<4} {:<12} {}",
            v.id.to_string().bold(),
            v.kind.label(),
            v.object_id,
            v.mapping_id,
            v.direction.label(),
            if v.name.is_empty() {
                "-".to_string()
            } else {
                v.name.clone()
            },
            values.dimmed()
        );
    }
}

fn parse_kind(s: &str) -> Result<ObjectKind> {
    match s {
        "sound" | "object" | "so" => Ok(ObjectKind::SoundObject),
        "in" | "input" => Ok(ObjectKind::MatrixInput),
        "out" | "output" => Ok(ObjectKind::MatrixOutput),
        _ => anyhow::bail!("unknown kind '{s}' (sound|in|out)"),
    }
}

fn parse_param(s: &str) -> Result<ParamId> {
    match s {
        "x" => Ok(ParamId::PosX),
        "y" => Ok(ParamId::PosY),
        "reverb" => Ok(ParamId::ReverbSend),
        "spread" => Ok(ParamId::Spread),
        "delay" => Ok(ParamId::DelayMode),
        "gain" => Ok(ParamId::Gain),
        "mute" => Ok(ParamId::Mute),
        _ => anyhow::bail!("unknown parameter '{s}'"),
    }
}

fn parse_direction(s: &str) -> Result<DirectionSetting> {
    match s {
        "none" | "off" => Ok(DirectionSetting::None),
        "rx" => Ok(DirectionSetting::Rx),
        "tx" => Ok(DirectionSetting::Tx),
        "both" => Ok(DirectionSetting::Both),
        _ => anyhow::bail!("unknown direction '{s}' (none|rx|tx|both)"),
    }
}

fn parse_mode(s: &str) -> Result<ExtensionMode> {
    match s {
        "off" => Ok(ExtensionMode::Off),
        "extend" => Ok(ExtensionMode::Extend),
        "mirror" => Ok(ExtensionMode::Mirror),
        "parallel" => Ok(ExtensionMode::Parallel),
        _ => anyhow::bail!("unknown mode '{s}'"),
    }
}

fn parse_side(s: &str) -> Result<ParallelSide> {
    match s {
        "first" => Ok(ParallelSide::First),
        "second" => Ok(ParallelSide::Second),
        "none" => Ok(ParallelSide::None),
        _ => anyhow::bail!("unknown side '{s}'"),
    }
}

fn parse_ids(parts: &[&str]) -> Result<Vec<ProcessorId>> {
    parts
        .iter()
        .map(|p| p.parse::<ProcessorId>().map_err(Into::into))
        .collect()
}
