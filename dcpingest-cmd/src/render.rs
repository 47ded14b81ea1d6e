use std::io::{stdout, Write};

use anyhow::{Context, Result};
use handlebars::handlebars_helper;
use serde::Serialize;

#[derive(Debug, Clone)]
pub enum Format {
    Json,
    Text,
}

impl clap::ValueEnum for Format {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Json, Self::Text]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Json => Some(clap::builder::PossibleValue::new("json")),
            Self::Text => Some(clap::builder::PossibleValue::new("text")),
        }
    }
}

fn pad(num: u64, v: &serde_json::Value, left: bool) -> String {
    let v = match v {
        serde_json::Value::String(s) => s.to_owned(),
        serde_json::Value::Null => String::new(),
        _ => v.to_string(),
    };
    let width = usize::try_from(num).unwrap_or(usize::MAX).max(v.len());
    if left {
        format!("{v:>width$}")
    } else {
        format!("{v:<width$}")
    }
}

handlebars_helper!(left_pad: |num: u64, v: Json| pad(num, v, true));
handlebars_helper!(right_pad: |num: u64, v: Json| pad(num, v, false));

pub fn render_text<T: Serialize>(template: &str, data: &T) -> Result<String> {
    let mut hb = handlebars::Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_helper("lpad", Box::new(left_pad));
    hb.register_helper("rpad", Box::new(right_pad));
    hb.register_template_string("text", template)
        .context("registering template")?;
    hb.render("text", data).context("rendering text")
}

/// Write `data` to stdout as pretty JSON, or as text rendered with `template`.
pub fn write<T: Serialize>(format: &Format, template: &str, data: &T) -> Result<()> {
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(stdout(), data).context("serializing to json")
        }
        Format::Text => {
            let text = render_text(template, data)?;
            stdout()
                .write_all(text.as_bytes())
                .context("writing to stdout")
        }
    }
}
