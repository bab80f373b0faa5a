use sysinfo::{ProcessesToUpdate, System};

/// Resident set size of this process in kilobytes, `None` when the platform
/// gives no process table access.
pub fn process_rss_kb() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.memory() / 1024)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn a_running_process_has_nonzero_rss() {
        let rss = process_rss_kb();
        assert!(rss.is_none() || rss.unwrap() > 0);
    }
}
