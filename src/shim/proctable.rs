use crate::mpir;
use crate::mpir::ProcTable;
use crate::shim::context::Context;
use crate::shim::error::Error;
use crate::shim::pmix::{DataArray, Info, Key, ProcInfo, ProcessControl, Proc, Query, Rank, Value};
use crate::shim::release::Releaser;
use log::debug;

/// Convert a process table query response into the MPIR layout.
///
/// Descriptors are placed at the rank of each entry, not in response order.
pub fn proc_table(response: &[Info]) -> Result<ProcTable, Error> {
    let procs = proc_infos(response)?;

    let size = procs.len();
    let mut table = ProcTable::with_size(size);
    for (i, info) in procs.iter().enumerate() {
        let idx = match info.proc.rank {
            Rank::Index(rank) if (rank as usize) < size => rank as usize,
            rank => {
                return Err(Error::RankOutOfRange {
                    rank: rank.raw(),
                    size,
                })
            }
        };
        if table.is_set(idx) {
            return Err(Error::DuplicateRank(idx as u32));
        }

        debug!(
            target: "shim",
            "task {i} rank {idx} host={} exec={} pid={} state={}",
            info.hostname, info.executable, info.pid, info.state
        );
        table
            .set(idx, &info.hostname, &info.executable, info.pid)
            .map_err(|e| Error::Protocol(format!("PMIx proc table entry {idx}: {e}")))?;
    }

    Ok(table)
}

fn proc_infos(response: &[Info]) -> Result<&[ProcInfo], Error> {
    let first = match response {
        [] => return Err(Error::EmptyProcTable),
        [first] => first,
        more => {
            return Err(Error::Protocol(format!(
                "PMIx proc table query returned {} results",
                more.len()
            )))
        }
    };

    match &first.value {
        Value::DataArray(DataArray::ProcInfo(procs)) => Ok(procs),
        Value::DataArray(DataArray::Null) => Err(Error::ProcTableNull),
        Value::DataArray(DataArray::Info(_)) => {
            Err(Error::ProcTableElementType("PMIX_INFO".to_string()))
        }
        Value::DataArray(DataArray::Other(type_name)) => {
            Err(Error::ProcTableElementType(type_name.clone()))
        }
        other => Err(Error::ProcTableType(other.type_name().to_string())),
    }
}

/// Reads the process map of the application and publishes it to the debugger.
pub struct Extractor<'a, P: ProcessControl> {
    pmix: &'a P,
    ctx: &'a Context,
}

impl<'a, P: ProcessControl> Extractor<'a, P> {
    pub fn new(pmix: &'a P, ctx: &'a Context) -> Self {
        Self { pmix, ctx }
    }

    /// Find the application namespace managed by the launcher (attach mode).
    pub fn query_application_namespace(&self) -> Result<Proc, Error> {
        let launcher = self.ctx.launcher();
        let query = Query {
            keys: vec![Key::QueryNamespaces],
            qualifiers: vec![
                Info::string(Key::Nspace, launcher.nspace.clone()),
                Info::new(Key::Rank, Value::Rank(launcher.rank)),
            ],
        };

        let response = self
            .pmix
            .query(&[query])
            .map_err(|status| Error::library(self.pmix, "PMIx_Query_info(namespaces)", status))?;

        match response.as_slice() {
            [Info {
                value: Value::Str(nspace),
                ..
            }] => {
                debug!(target: "shim", "application namespace is '{nspace}'");
                Ok(Proc::wildcard(nspace.clone()))
            }
            _ => Err(Error::NamespaceQueryFormat),
        }
    }

    /// Query the process table of the application, publish it, notify the debugger.
    pub fn publish(&self) -> Result<(), Error> {
        let application = self.ctx.application();
        let query = Query {
            keys: vec![Key::QueryProcTable],
            qualifiers: vec![Info::string(Key::Nspace, application.nspace.clone())],
        };

        let response = self
            .pmix
            .query(&[query])
            .map_err(|status| Error::library(self.pmix, "PMIx_Query_info(proc table)", status))?;
        let table = proc_table(&response)?;
        debug!(
            target: "shim",
            "received proc table of {} procs for '{}'",
            table.len(),
            application.nspace
        );

        mpir::publish(table);
        mpir::breakpoint();
        self.ctx.hook().on_breakpoint(
            &mpir::snapshot(),
            &Releaser::new(self.pmix, self.ctx),
        );
        Ok(())
    }
}
