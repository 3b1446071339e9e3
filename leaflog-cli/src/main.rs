/*
 * This file is a part of leaflog.
 *
 * leaflog is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * leaflog is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with leaflog. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Thin inspection CLI over a leaflog store. Never mutates a store
//! file: every subcommand opens with `create_if_missing = false` and
//! simply reads.

mod cli;

use clap::Parser;
use cli::{Cli, Command};
use env_logger::Builder;
use leaflog::{DefaultSchema, Document, DumpOptions, Log, Value};
use log::error as err;
use std::env;
use std::process;
use std::rc::Rc;

fn main() {
    Builder::new()
        .parse_filters(&env::var("LEAFLOG_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Dump { file, json, color, depth, flat } => dump(&file, json, color, depth, flat),
        Command::Check { file } => check(&file),
        Command::Get { file, path } => get(&file, &path),
    };
    if let Err(msg) = result {
        err!("{msg}");
        process::exit(1);
    }
}

fn open_readonly(file: &str) -> Result<Document, String> {
    Document::open(file, Rc::new(DefaultSchema), false, false).map_err(|e| e.to_string())
}

fn dump(file: &str, json: bool, color: bool, depth: Option<usize>, flat: bool) -> Result<(), String> {
    let doc = open_readonly(file)?;
    if json {
        let value = doc.to_json_value().map_err(|e| e.to_string())?;
        println!("{}", serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?);
        return Ok(());
    }
    let opts = DumpOptions { help: false, color, depth, flat };
    print!("{}", doc.dump(&opts).map_err(|e| e.to_string())?);
    Ok(())
}

fn check(file: &str) -> Result<(), String> {
    let log = Log::open(file, false, false).map_err(|e| e.to_string())?;
    log.scan().map_err(|e| e.to_string())?;
    println!("{file}: OK");
    Ok(())
}

fn get(file: &str, path: &str) -> Result<(), String> {
    let doc = open_readonly(file)?;
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    match doc.get_path(&segments).map_err(|e| e.to_string())? {
        None => Err(format!("no such path: {path}")),
        Some(Value::Leaf(v)) => {
            println!("{v}");
            Ok(())
        }
        Some(Value::Tree(t)) => {
            let value = t.to_json_value().map_err(|e| e.to_string())?;
            println!("{}", serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?);
            Ok(())
        }
    }
}
