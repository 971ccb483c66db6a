//! First-argument CLI surface
//!
//! Only the first argument selects a mode; everything unrecognized belongs
//! to the entry point and is forwarded untouched, which is why this is a
//! plain match and not a parser.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Help,
    List,
    Link { target: String, args: Vec<String> },
    PngIcon,
    SvgIcon,
    Desktop,
    Appstream,
    PortableHome,
    PortableConfig,
    Extract { globs: Vec<String> },
    ExtractAndRun { args: Vec<String> },
    Mount { dir: Option<PathBuf> },
    Offset,
    Cleanup,
    InternalCleanup {
        mount_dir: PathBuf,
        pool_dir: PathBuf,
        work_dir: PathBuf,
        do_not_unmount: bool,
    },
    Run { args: Vec<String> },
}

pub fn parse(argv: Vec<String>) -> Invocation {
    let Some(first) = argv.first().map(String::as_str) else {
        return Invocation::Run { args: Vec::new() };
    };
    let rest: Vec<String> = argv[1..].to_vec();

    match first {
        "--pbundle_help" => Invocation::Help,
        "--pbundle_list" => Invocation::List,
        "--pbundle_link" => {
            let mut rest = rest.into_iter();
            match rest.next() {
                Some(target) => Invocation::Link {
                    target,
                    args: rest.collect(),
                },
                None => Invocation::Help,
            }
        }
        "--pbundle_pngIcon" => Invocation::PngIcon,
        "--pbundle_svgIcon" => Invocation::SvgIcon,
        "--pbundle_desktop" => Invocation::Desktop,
        "--pbundle_appstream" => Invocation::Appstream,
        "--pbundle_portableHome" => Invocation::PortableHome,
        "--pbundle_portableConfig" => Invocation::PortableConfig,
        "--pbundle_extract" | "--appimage-extract" => Invocation::Extract { globs: rest },
        "--pbundle_extract-and-run" | "--appimage-extract-and-run" => {
            Invocation::ExtractAndRun { args: rest }
        }
        "--pbundle_mount" | "--appimage-mount" => Invocation::Mount {
            dir: rest.first().map(PathBuf::from),
        },
        "--pbundle_offset" | "--appimage-offset" => Invocation::Offset,
        "--pbundle_cleanup" => Invocation::Cleanup,
        "--pbundle_internal_Cleanup" if rest.len() >= 4 => Invocation::InternalCleanup {
            mount_dir: PathBuf::from(&rest[0]),
            pool_dir: PathBuf::from(&rest[1]),
            work_dir: PathBuf::from(&rest[2]),
            do_not_unmount: rest[3] == "1" || rest[3] == "true",
        },
        _ => Invocation::Run { args: argv },
    }
}

pub const HELP_TEXT: &str = "\
Flags (first argument only; anything else goes to the entry point):
  --pbundle_help                      Show this help and the bundle identity
  --pbundle_list                      Mount and print every path in the bundle
  --pbundle_link <bin> [args...]      Run <bin> instead of AppRun
  --pbundle_pngIcon                   Base64 of .DirIcon to stdout
  --pbundle_svgIcon                   Base64 of .DirIcon.svg to stdout
  --pbundle_desktop                   Base64 of the first top-level .desktop file
  --pbundle_appstream                 Base64 of the first top-level .xml file
  --pbundle_portableHome              Create <bundle>.home for a portable HOME
  --pbundle_portableConfig            Create <bundle>.config for XDG_CONFIG_HOME
  --pbundle_extract [globs...]        Extract the image next to the bundle
  --pbundle_extract-and-run [args...] Extract instead of mounting, then run
  --pbundle_mount [<dir>]             Mount and idle until signalled
  --pbundle_offset                    Print the image offset in bytes
  --pbundle_cleanup                   Unmount and remove this bundle's workdirs
  --appimage-extract | --appimage-extract-and-run | --appimage-mount | --appimage-offset
                                      AppImage-compatible synonyms
";

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unknown_first_arg_is_forwarded() {
        let parsed = parse(argv(&["--verbose", "file.txt"]));
        assert_eq!(
            parsed,
            Invocation::Run {
                args: argv(&["--verbose", "file.txt"])
            }
        );
    }

    #[test]
    fn test_no_args_runs_entrypoint() {
        assert_eq!(parse(Vec::new()), Invocation::Run { args: Vec::new() });
    }

    #[test]
    fn test_link_splits_target_and_args() {
        let parsed = parse(argv(&["--pbundle_link", "bash", "-c", "id"]));
        assert_eq!(
            parsed,
            Invocation::Link {
                target: "bash".into(),
                args: argv(&["-c", "id"]),
            }
        );
    }

    #[test]
    fn test_appimage_synonyms() {
        assert_eq!(
            parse(argv(&["--appimage-offset"])),
            Invocation::Offset
        );
        assert_eq!(
            parse(argv(&["--appimage-extract", "usr/*"])),
            Invocation::Extract {
                globs: argv(&["usr/*"])
            }
        );
        assert_eq!(
            parse(argv(&["--appimage-mount"])),
            Invocation::Mount { dir: None }
        );
    }

    #[test]
    fn test_internal_cleanup_arity() {
        let parsed = parse(argv(&[
            "--pbundle_internal_Cleanup",
            "/t/m",
            "/t/p",
            "/t/w",
            "1",
        ]));
        assert_eq!(
            parsed,
            Invocation::InternalCleanup {
                mount_dir: PathBuf::from("/t/m"),
                pool_dir: PathBuf::from("/t/p"),
                work_dir: PathBuf::from("/t/w"),
                do_not_unmount: true,
            }
        );
        // Malformed internal invocations fall through to the entry point.
        assert!(matches!(
            parse(argv(&["--pbundle_internal_Cleanup", "/t/m"])),
            Invocation::Run { .. }
        ));
    }
}
