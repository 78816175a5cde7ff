//! Multi-process test support. An [`mpi_test!`](crate::mpi_test) test re-launches
//! the test binary under an MPI launcher, which then runs the ignored body on
//! every rank.

use std::process::Command;

pub use paste::paste;

/// Environment variable overriding the launcher, e.g. `srun` on a cluster.
pub const LAUNCHER_VARIABLE: &str = "AMBIENT_MPIRUN";

/// The name under which the test harness knows a test declared in `module_path`,
/// i.e. the module path without the crate name.
///
/// # Examples
/// ```
/// # use ambient::channel::testing::harness_name;
/// assert_eq!(harness_name("mycrate", "my_test"), "my_test");
/// assert_eq!(harness_name("mycrate::foo::bar", "my_test"), "foo::bar::my_test");
/// ```
pub fn harness_name(module_path: &str, test_name: &str) -> String {
    match module_path.split_once("::") {
        Some((_, modules)) => format!("{modules}::{test_name}"),
        None => test_name.to_string(),
    }
}

fn launcher() -> String {
    std::env::var(LAUNCHER_VARIABLE).unwrap_or_else(|_| "mpirun".into())
}

/// Runs the ignored test `harness_name` of the current test binary on `ranks`
/// processes and fails if any of them fails.
pub fn launch(harness_name: &str, ranks: usize) {
    let executable = std::env::current_exe().expect("test executable path");
    let launcher = launcher();
    let status = Command::new(&launcher)
        .args(["-n", &ranks.to_string(), "--allow-run-as-root"])
        .arg(executable)
        .args([harness_name, "--ignored", "--exact"])
        .status()
        .unwrap_or_else(|error| panic!("could not run {launcher}: {error}"));
    assert!(status.success(), "{harness_name} failed on {ranks} ranks");
}

/// Declares a test whose body runs on the given number of MPI ranks.
#[macro_export]
macro_rules! mpi_test {
    ($ranks:expr, fn $name:ident $_:tt $body:block) => {
        $crate::channel::testing::paste! {
            #[test]
            fn $name() {
                let name = $crate::channel::testing::harness_name(
                    module_path!(),
                    concat!(stringify!($name), "_on_rank"),
                );
                $crate::channel::testing::launch(&name, $ranks);
            }

            #[test]
            #[ignore = "runs under an MPI launcher"]
            fn [<$name _on_rank>]() $body
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_name() {
        assert_eq!(harness_name("ambient", "solo"), "solo");
        assert_eq!(
            harness_name("ambient::channel::testing", "solo"),
            "channel::testing::solo"
        );
    }
}
