use anyhow::{bail, Context, Result};
use clap::Parser;
use documented::DocumentedFields;
use rootdisk::config::global::{BootServiceConfig, GlobalConfig, OverlayConfig};
use shadow_rs::shadow;
use toml_edit::{Decor, DocumentMut, Item, RawString, Table};

shadow!(build);

use crate::build::CLAP_LONG_VERSION;

/// Print a commented template of the rootdisk configuration files.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[clap(long_version = CLAP_LONG_VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub template: TemplateType,
}

#[derive(Parser, Debug)]
pub enum TemplateType {
    /// Template of `global.toml`.
    Global,
}

/// Doc comments of the fields of a table, `None` for undocumented fields.
type FieldDocs = fn(&str) -> Option<&'static str>;

fn field_docs<T: DocumentedFields>(field: &str) -> Option<&'static str> {
    T::get_field_docs(field).ok()
}

fn prepend_comment(decor: &mut Decor, docs: &str) {
    let prefix = decor
        .prefix()
        .and_then(RawString::as_str)
        .unwrap_or_default()
        .to_owned();
    let separator = match prefix.lines().last() {
        None | Some("") => "",
        Some(_) => "#\n",
    };

    let comment = docs
        .lines()
        .map(|line| match line {
            "" => "#\n".to_owned(),
            line => format!("# {line}\n"),
        })
        .collect::<String>();

    decor.set_prefix(format!("{prefix}{separator}{comment}"));
}

fn annotate(table: &mut Table, docs: FieldDocs) -> Result<()> {
    for (mut key, item) in table.iter_mut() {
        let Some(doc) = docs(key.get()) else {
            continue;
        };

        match item {
            Item::None => bail!("Key `{}` has no value", key.get()),
            Item::Value(_) => prepend_comment(key.leaf_decor_mut(), doc),
            Item::Table(sub_table) => prepend_comment(sub_table.decor_mut(), doc),
            Item::ArrayOfTables(array) => {
                let first = array
                    .iter_mut()
                    .next()
                    .context("Array of tables should not be empty")?;
                prepend_comment(first.decor_mut(), doc);
            }
        }
    }
    Ok(())
}

fn global_template() -> Result<DocumentMut> {
    let config = GlobalConfig {
        overlay: Some(OverlayConfig { f2fs: false }),
        boot: Some(BootServiceConfig { verbose: false }),
    };
    let mut doc = toml_edit::ser::to_string_pretty(&config)?.parse::<DocumentMut>()?;

    annotate(doc.as_table_mut(), field_docs::<GlobalConfig>)
        .context("Failed to annotate `GlobalConfig`")?;

    let sections: [(&str, FieldDocs); 2] = [
        ("overlay", field_docs::<OverlayConfig>),
        ("boot", field_docs::<BootServiceConfig>),
    ];
    for (section, docs) in sections {
        if let Some(table) = doc.get_mut(section).and_then(Item::as_table_mut) {
            annotate(table, docs).with_context(|| format!("Failed to annotate `[{section}]`"))?;
        }
    }

    Ok(doc)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let doc = match args.template {
        TemplateType::Global => global_template()?,
    };

    print!("{doc}");
    Ok(())
}
