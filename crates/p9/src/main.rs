use {
    clap::{Parser, Subcommand},
    plan9::{
        Config, DMDIR, Dir, Fsys, OREAD, OTRUNC, OWRITE, Perm,
        dial::{dial_args, dial_config, getuser},
    },
    tokio::io::{self, AsyncReadExt, AsyncWriteExt},
};

#[derive(Debug, Parser)]
#[command(name = "9p", about = "Talk to a 9P2000 file server")]
struct Cli {
    /// network!netaddr!service
    /// where: network = tcp | unix
    #[arg(short, long, env = "P9_ADDR")]
    addr: String,

    /// File tree to attach to
    #[arg(short = 'A', long, default_value = "")]
    aname: String,

    /// User to attach as, the current user by default
    #[arg(short, long)]
    user: Option<String>,

    /// Largest message to negotiate
    #[arg(long, default_value_t = Config::default().msize)]
    msize: u32,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Copy a file to standard output
    Read { path: String },
    /// Copy standard input to a file, truncating it
    Write { path: String },
    /// Print a file's metadata
    Stat { path: String },
    /// List a directory
    Ls {
        /// Long listing
        #[arg(short)]
        l: bool,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Remove a file
    Rm { path: String },
    /// Create a file
    Create {
        /// Make a directory
        #[arg(long)]
        dir: bool,
        /// Permission bits, in octal
        #[arg(long, default_value = "644", value_parser = parse_perm)]
        perm: u32,
        path: String,
    },
}

fn parse_perm(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|e| e.to_string())
}

fn long_line(d: &Dir) -> String {
    format!(
        "{} {} {} {} {} {:>8} {} {}",
        d.mode,
        char::from_u32(d.typ as u32).unwrap_or('?'),
        d.dev,
        d.uid,
        d.gid,
        d.length,
        d.mtime,
        d.name
    )
}

async fn run(fsys: &Fsys, cmd: Cmd) -> plan9::Result<()> {
    match cmd {
        Cmd::Read { path } => {
            let mut fid = fsys.open(&path, OREAD).await?;
            let mut buf = vec![0; fid.iounit() as usize];
            let mut stdout = io::stdout();
            let copied = loop {
                match fid.read(&mut buf).await {
                    Ok(0) => break Ok(()),
                    Ok(n) => stdout.write_all(&buf[..n]).await?,
                    Err(e) => break Err(e),
                }
            };
            stdout.flush().await?;
            let _ = fid.close().await;
            copied
        }
        Cmd::Write { path } => {
            let mut data = Vec::new();
            io::stdin().read_to_end(&mut data).await?;
            let mut fid = fsys.open(&path, OWRITE | OTRUNC).await?;
            let written = fid.write(&data).await;
            let _ = fid.close().await;
            let n = written?;
            if n < data.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("short write: {} of {} bytes", n, data.len()),
                )
                .into());
            }
            Ok(())
        }
        Cmd::Stat { path } => {
            println!("{}", fsys.stat(&path).await?);
            Ok(())
        }
        Cmd::Ls { l, path } => {
            let d = fsys.stat(&path).await?;
            let mut entries = if d.mode.is_dir() {
                let mut fid = fsys.open(&path, OREAD).await?;
                let entries = fid.dirreadall().await;
                let _ = fid.close().await;
                entries?
            } else {
                vec![d]
            };
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            for d in &entries {
                if l {
                    println!("{}", long_line(d));
                } else {
                    println!("{}", d.name);
                }
            }
            Ok(())
        }
        Cmd::Rm { path } => fsys.remove(&path).await,
        Cmd::Create { dir, perm, path } => {
            let (mode, perm) = if dir {
                (OREAD, Perm(DMDIR | perm))
            } else {
                (OWRITE, Perm(perm))
            };
            fsys.create(&path, mode, perm).await?.close().await
        }
    }
}

async fn p9_main(
    Cli {
        addr,
        aname,
        user,
        msize,
        cmd,
    }: Cli,
) -> plan9::Result<i32> {
    let (network, netaddr) = dial_args(&addr)?;
    let config = Config {
        msize,
        ..Default::default()
    };
    let conn = dial_config(&network, &netaddr, config).await?;
    let user = user.unwrap_or_else(getuser);

    let fsys = match conn.attach(None, &user, &aname).await {
        Ok(fsys) => fsys,
        Err(e) => {
            conn.close().await;
            return Err(e);
        }
    };
    let result = run(&fsys, cmd).await;
    let _ = fsys.close().await;
    conn.close().await;
    result.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = p9_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("9p: {}", e);
        1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perm_is_octal() {
        assert_eq!(parse_perm("644"), Ok(0o644));
        assert_eq!(parse_perm("0o755"), Ok(0o755));
        assert!(parse_perm("9").is_err());
    }

    #[test]
    fn cli_parses() {
        let cli = Cli::try_parse_from(["9p", "-a", "tcp!localhost", "ls", "-l", "/lib"]).unwrap();
        assert_eq!(cli.addr, "tcp!localhost");
        assert!(matches!(cli.cmd, Cmd::Ls { l: true, ref path } if path == "/lib"));

        let cli = Cli::try_parse_from([
            "9p", "-a", "unix!/tmp/sock", "-u", "glenda", "create", "--dir", "--perm", "755", "d",
        ])
        .unwrap();
        assert_eq!(cli.user.as_deref(), Some("glenda"));
        assert!(matches!(cli.cmd, Cmd::Create { dir: true, perm: 0o755, .. }));
    }

    #[test]
    fn long_listing() {
        let d = Dir {
            typ: 'M' as u16,
            mode: Perm(0o644),
            uid: "glenda".to_owned(),
            gid: "sys".to_owned(),
            length: 42,
            mtime: 7,
            name: "motd".to_owned(),
            ..Default::default()
        };
        assert_eq!(
            long_line(&d),
            "--rw-r--r-- M 0 glenda sys       42 7 motd"
        );
    }
}
