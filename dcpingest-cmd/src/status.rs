use std::path::Path;

use anyhow::{bail, Context, Result};
use dcpingest::status::{SourceStatus, StatusTable};
use serde::Serialize;

use crate::render::{self, Format};

#[derive(Debug, Serialize)]
struct Report {
    filename: String,
    sources: Vec<SourceStatus>,
}

pub fn status(fpath: &Path, format: &Format) -> Result<()> {
    if !fpath.exists() {
        bail!("{fpath:?} does not exist");
    }
    let table = StatusTable::load(fpath).with_context(|| format!("loading {fpath:?}"))?;
    let report = Report {
        filename: fpath.to_string_lossy().to_string(),
        sources: table.snapshot(),
    };
    render::write(format, TEXT_TEMPLATE, &report)
}

const TEXT_TEMPLATE: &str = r"{{ filename }}
====================================================================================================================
Name                 Host                       Port  Period    Good  Failed      Msgs  Last contact
--------------------------------------------------------------------------------------------------------------------
{{ #each sources }}{{ rpad 20 name }} {{ rpad 25 host }} {{ lpad 6 port }} {{ lpad 7 period_minutes }} {{ lpad 7 good_polls }} {{ lpad 7 failed_polls }} {{ lpad 9 messages }}  {{ last_contact }}
{{ /each }}";
