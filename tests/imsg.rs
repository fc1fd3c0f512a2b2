use smtpfd::imsg::{Handler, Header, ImsgType};
use std::io;

#[tokio::test]
async fn test_imsg_round_trip() -> Result<(), io::Error> {
    let (sender, receiver) = Handler::pair()?;
    let mut count = 3;

    tokio::spawn(async move {
        for id in 1..=count {
            let (keep, pass) = Handler::socketpair().unwrap();

            let mut header = Header::new(ImsgType::ReconfFilterProc);
            header.peer_id = id as u32;

            if let Err(err) = sender
                .send_message(header, Some(&pass), &format!("filter-{}", id))
                .await
            {
                eprintln!("Failed to send message: {}", err);
            }
            drop(keep);
        }
    });

    let mut expected = 1u32;
    loop {
        match receiver.recv_imsg().await? {
            None => break,
            Some(imsg) => {
                assert_eq!(imsg.imsg_type(), Ok(ImsgType::ReconfFilterProc));
                assert_eq!(imsg.header.peer_id, expected);
                assert!(imsg.fd.is_some(), "descriptor must travel with its message");

                let name: String = imsg.decode()?;
                assert_eq!(name, format!("filter-{}", expected));

                count -= 1;
                expected += 1;
            }
        }
    }

    assert_eq!(count, 0, "did not receive expected messages");

    Ok(())
}

#[tokio::test]
async fn test_imsg_preserves_order_across_coalesced_reads() -> Result<(), io::Error> {
    let (sender, receiver) = Handler::pair()?;

    // All three frames usually arrive in a single read.
    sender
        .send_message(Header::new(ImsgType::ReconfConf), None, &())
        .await?;
    sender
        .send_message(Header::new(ImsgType::ReconfFilter), None, &"a".to_string())
        .await?;
    sender
        .send_message(Header::new(ImsgType::ReconfEnd), None, &())
        .await?;

    let first = receiver.recv_imsg().await?.unwrap();
    assert_eq!(first.imsg_type(), Ok(ImsgType::ReconfConf));
    assert!(first.data.is_empty());

    let second = receiver.recv_imsg().await?.unwrap();
    assert_eq!(second.imsg_type(), Ok(ImsgType::ReconfFilter));
    assert_eq!(second.decode::<String>()?, "a");

    let third = receiver.recv_imsg().await?.unwrap();
    assert_eq!(third.imsg_type(), Ok(ImsgType::ReconfEnd));
    assert!(third.data.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_imsg_batched_descriptors_stay_attached() -> Result<(), io::Error> {
    let (sender, receiver) = Handler::pair()?;

    let (fd_a, fd_b) = Handler::socketpair()?;
    sender
        .send_message(Header::new(ImsgType::SocketIpc), Some(&fd_a), &())
        .await?;
    sender
        .send_message(
            Header::new(ImsgType::ReconfFilterProc),
            Some(&fd_b),
            &"grey".to_string(),
        )
        .await?;

    // Both messages and both descriptors may arrive in one batch; each
    // message must still claim its own descriptor.
    let first = receiver.recv_imsg().await?.unwrap();
    assert_eq!(first.imsg_type(), Ok(ImsgType::SocketIpc));
    assert!(first.fd.is_some());

    let second = receiver.recv_imsg().await?.unwrap();
    assert_eq!(second.imsg_type(), Ok(ImsgType::ReconfFilterProc));
    assert!(second.fd.is_some());

    Ok(())
}

#[tokio::test]
async fn test_imsg_closed_channel_is_a_sentinel() -> Result<(), io::Error> {
    let (sender, receiver) = Handler::pair()?;

    sender
        .send_message(Header::new(ImsgType::CtlReload), None, &())
        .await?;
    drop(sender);

    assert!(receiver.recv_imsg().await?.is_some());
    assert!(receiver.recv_imsg().await?.is_none());

    Ok(())
}
