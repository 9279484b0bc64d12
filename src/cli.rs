use std::{error::Error, path::Path};

use log::info;

use crate::api::GitFetcher;
use crate::git::{read_head, Git};
use crate::input::{Attr, Input};

/// Handler for the fetch command: resolve, snapshot, and print the
/// locked metadata as JSON.
pub fn do_fetch(fetcher: &GitFetcher, input: Input) -> Result<(), Box<dyn Error>> {
    let (_accessor, locked) = fetcher.fetch(input)?;

    let attrs: serde_json::Map<String, serde_json::Value> = locked
        .to_attrs()
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Attr::String(s) => serde_json::Value::from(s),
                Attr::Bool(b) => serde_json::Value::from(b),
                Attr::Int(n) => serde_json::Value::from(n),
            };
            (key, value)
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&attrs)?);
    Ok(())
}

/// Handler for the clone command.
pub fn do_clone(fetcher: &GitFetcher, input: Input, dest: &Path) -> Result<(), Box<dyn Error>> {
    fetcher.clone_to(&input, dest)?;
    info!("cloned '{}' into '{}'", input, dest.display());
    Ok(())
}

/// Handler for the head command: print the remote's default branch.
pub fn do_head(url: &str) -> Result<(), Box<dyn Error>> {
    match read_head(&Git::new(), url) {
        Some(head) => {
            println!("{head}");
            Ok(())
        }
        None => Err(format!("could not read HEAD of '{url}'").into()),
    }
}
