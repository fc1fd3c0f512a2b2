use nix::unistd::Pid;
use smtpfd::{
    config::{Config, FilterSpec},
    imsg::{Handler, Imsg, ImsgType},
    parent::send_config,
    process::FilterChild,
    Error,
};

fn filter(name: &str, args: &[&str]) -> FilterSpec {
    FilterSpec {
        name: name.to_string(),
        chain: false,
        args: args.iter().map(|arg| arg.to_string()).collect(),
    }
}

fn chain(name: &str, members: &[&str]) -> FilterSpec {
    FilterSpec {
        name: name.to_string(),
        chain: true,
        args: members.iter().map(|member| member.to_string()).collect(),
    }
}

/// Spawn callback that creates a socketpair instead of forking.
fn fake_spawn(first_pid: i32) -> impl FnMut(&FilterSpec) -> Result<FilterChild, Error> {
    let mut pid = first_pid;
    move |_spec| {
        let (fd, other) = Handler::socketpair()?;
        drop(other);
        pid += 1;
        Ok(FilterChild {
            fd,
            pid: Pid::from_raw(pid),
        })
    }
}

async fn collect_sequence(engine: &Handler) -> Result<Vec<(ImsgType, String, bool)>, Error> {
    let mut sequence = Vec::new();
    loop {
        let imsg = engine.recv_imsg().await?.expect("engine channel closed");
        let id = imsg.imsg_type().expect("unknown message type");
        let name = match id {
            ImsgType::ReconfFilter | ImsgType::ReconfFilterProc | ImsgType::ReconfFilterNode => {
                named(&imsg)?
            }
            _ => String::new(),
        };
        let has_fd = imsg.fd.is_some();
        sequence.push((id, name, has_fd));
        if id == ImsgType::ReconfEnd {
            break;
        }
    }
    Ok(sequence)
}

fn named(imsg: &Imsg) -> Result<String, Error> {
    imsg.decode::<String>().map_err(Into::into)
}

#[tokio::test]
async fn configuration_is_bracketed_and_ordered() -> Result<(), Error> {
    let conf = Config {
        filters: vec![
            filter("reject-empty", &["/usr/libexec/fbad"]),
            chain("all", &["reject-empty"]),
        ],
    };

    let (to_engine, engine) = Handler::pair()?;
    send_config(&to_engine, &conf, fake_spawn(7000)).await?;

    let sequence = collect_sequence(&engine).await?;
    assert_eq!(
        sequence,
        vec![
            (ImsgType::ReconfConf, String::new(), false),
            (ImsgType::ReconfFilterProc, "reject-empty".to_string(), true),
            (ImsgType::ReconfFilter, "reject-empty".to_string(), false),
            (ImsgType::ReconfFilter, "all".to_string(), false),
            (ImsgType::ReconfFilterNode, "reject-empty".to_string(), false),
            (ImsgType::ReconfEnd, String::new(), false),
        ]
    );

    Ok(())
}

#[tokio::test]
async fn attach_messages_carry_the_child_pid() -> Result<(), Error> {
    let conf = Config {
        filters: vec![filter("grey", &["/usr/libexec/fgrey"])],
    };

    let (to_engine, engine) = Handler::pair()?;
    send_config(&to_engine, &conf, fake_spawn(7000)).await?;

    let begin = engine.recv_imsg().await?.unwrap();
    assert_eq!(begin.imsg_type(), Ok(ImsgType::ReconfConf));

    let attach = engine.recv_imsg().await?.unwrap();
    assert_eq!(attach.imsg_type(), Ok(ImsgType::ReconfFilterProc));
    assert_eq!(attach.header.pid, 7001);

    Ok(())
}

#[tokio::test]
async fn empty_configuration_still_sends_the_bracket() -> Result<(), Error> {
    let conf = Config::default();

    let (to_engine, engine) = Handler::pair()?;
    send_config(&to_engine, &conf, fake_spawn(7000)).await?;

    let sequence = collect_sequence(&engine).await?;
    assert_eq!(
        sequence,
        vec![
            (ImsgType::ReconfConf, String::new(), false),
            (ImsgType::ReconfEnd, String::new(), false),
        ]
    );

    Ok(())
}

#[tokio::test]
async fn nested_chains_expand_depth_first() -> Result<(), Error> {
    let conf = Config {
        filters: vec![
            filter("b", &["/bin/b"]),
            filter("d", &["/bin/d"]),
            filter("e", &["/bin/e"]),
            chain("c", &["d", "e"]),
            chain("a", &["b", "c"]),
        ],
    };

    let (to_engine, engine) = Handler::pair()?;
    send_config(&to_engine, &conf, fake_spawn(100)).await?;

    let sequence = collect_sequence(&engine).await?;
    let nodes_of = |name: &str| -> Vec<String> {
        let mut nodes = Vec::new();
        let mut inside = false;
        for (id, entry, _) in &sequence {
            match id {
                ImsgType::ReconfFilter => inside = entry.as_str() == name,
                ImsgType::ReconfFilterNode if inside => nodes.push(entry.clone()),
                _ => {}
            }
        }
        nodes
    };

    assert_eq!(nodes_of("a"), vec!["b", "d", "e"]);
    assert_eq!(nodes_of("c"), vec!["d", "e"]);
    // Concrete filters are declared without expansion nodes.
    assert_eq!(nodes_of("b"), Vec::<String>::new());

    Ok(())
}

#[tokio::test]
async fn distribution_failure_is_surfaced() {
    let conf = Config {
        filters: vec![filter("grey", &["/usr/libexec/fgrey"])],
    };

    let (to_engine, engine) = Handler::pair().unwrap();
    drop(engine);

    // A dead engine channel aborts the sequence with an error instead
    // of silently dropping messages.
    let result = send_config(&to_engine, &conf, fake_spawn(100)).await;
    assert!(result.is_err());
}
