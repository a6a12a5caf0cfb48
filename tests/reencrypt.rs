use std::collections::BTreeSet;
use std::sync::Arc;

use calypso_lts::verify::{AllowAll, Authorizer, DenyAll, ReadProofAuthorizer};
use calypso_lts::{DecryptKey, Error, KeyPair, LocalCluster, LtsId, Read, Write};

const POLICY: &[u8] = b"darc:readers";

fn request(lts_id: LtsId, x: &curve25519_dalek::ristretto::RistrettoPoint, key: &[u8], reader: &KeyPair) -> DecryptKey {
    let write = Write::new(lts_id, POLICY, x, key).unwrap();
    let read = Read::new(&write, reader.public);
    DecryptKey::with_read_proof(write, read).unwrap()
}

#[tokio::test]
async fn test_decrypt_with_one_node_down() {
    let cluster = LocalCluster::new(5).unwrap();
    let lts = cluster.node(0).create_lts(LtsId::random(), &cluster.roster()).await.unwrap();

    let reader = KeyPair::random();
    let key = b"0123456789abcdef0123456789abcdef";
    let req = request(lts.lts_id, &lts.x, key, &reader);

    cluster.pause(3);
    let reply = cluster.node(0).decrypt_key(&req).await.unwrap();
    assert_eq!(reply.x, lts.x);
    assert_eq!(reply.recover_key(&reader.private).unwrap(), key);

    // another reader's key doesn't open it
    let other = KeyPair::random();
    assert_ne!(reply.recover_key(&other.private).ok().as_deref(), Some(&key[..]));
}

#[tokio::test]
async fn test_too_many_nodes_down() {
    let cluster = LocalCluster::new(4).unwrap();
    let lts = cluster.node(0).create_lts(LtsId::random(), &cluster.roster()).await.unwrap();
    let reader = KeyPair::random();
    let req = request(lts.lts_id, &lts.x, b"key", &reader);

    cluster.pause(2);
    cluster.pause(3);
    assert!(matches!(
        cluster.node(0).decrypt_key(&req).await,
        Err(Error::NotEnoughShares)
    ));
}

#[tokio::test]
async fn test_followers_refuse() {
    let cluster = LocalCluster::builder(4)
        .authorizer_with(|i| -> Arc<dyn Authorizer> {
            if i == 0 {
                Arc::new(AllowAll)
            } else {
                Arc::new(DenyAll)
            }
        })
        .build()
        .unwrap();
    let lts = cluster.node(0).create_lts(LtsId::random(), &cluster.roster()).await.unwrap();
    let req = request(lts.lts_id, &lts.x, b"key", &KeyPair::random());

    assert!(matches!(
        cluster.node(0).decrypt_key(&req).await,
        Err(Error::NotEnoughShares)
    ));
}

#[tokio::test]
async fn test_coordinator_refuses() {
    let cluster = LocalCluster::builder(4).authorizer(Arc::new(DenyAll)).build().unwrap();
    let lts = cluster.node(1).create_lts(LtsId::random(), &cluster.roster()).await.unwrap();
    let req = request(lts.lts_id, &lts.x, b"key", &KeyPair::random());

    assert!(matches!(cluster.node(1).decrypt_key(&req).await, Err(Error::Refused)));
}

#[tokio::test]
async fn test_nodes_agree_on_lts() {
    let cluster = LocalCluster::new(7).unwrap();
    let lts = cluster.node(2).create_lts(LtsId::random(), &cluster.roster()).await.unwrap();
    assert_eq!(lts.roster.list[0].address, "node-2");

    let mut indices = BTreeSet::new();
    let mut polys = Vec::new();
    for node in cluster.nodes() {
        let record = node.store().get(&lts.lts_id).unwrap();
        assert_eq!(record.x, lts.x);
        assert_eq!(record.shared.commits, record.dks.commits);
        assert_eq!(record.roster, lts.roster);
        indices.insert(record.shared.index);
        polys.push(record.poly);
    }
    assert_eq!(indices.len(), 7);
    assert!(polys.windows(2).all(|w| w[0] == w[1]));

    // any node of the roster can coordinate
    let reader = KeyPair::random();
    let req = request(lts.lts_id, &lts.x, b"shared by all", &reader);
    let reply = cluster.node(5).decrypt_key(&req).await.unwrap();
    assert_eq!(reply.recover_key(&reader.private).unwrap(), b"shared by all");
}

#[tokio::test]
async fn test_batch_items_are_independent() {
    let cluster = LocalCluster::builder(4)
        .authorizer(Arc::new(ReadProofAuthorizer::new(POLICY)))
        .build()
        .unwrap();
    let lts = cluster.node(0).create_lts(LtsId::random(), &cluster.roster()).await.unwrap();
    let reader = KeyPair::random();

    let mut reqs: Vec<DecryptKey> = (0..4u8)
        .map(|k| request(lts.lts_id, &lts.x, &[k; 20], &reader))
        .collect();
    // the second item carries no proof
    reqs[1].verification_data.clear();

    cluster.pause(3);
    let replies = cluster.node(0).decrypt_keys(&reqs).await.unwrap();
    assert_eq!(replies.len(), 4);
    for (k, reply) in replies.into_iter().enumerate() {
        if k == 1 {
            assert!(matches!(reply, Err(Error::Refused)));
        } else {
            assert_eq!(reply.unwrap().recover_key(&reader.private).unwrap(), [k as u8; 20]);
        }
    }
}

#[tokio::test]
async fn test_batch_over_different_rosters() {
    let cluster = LocalCluster::new(4).unwrap();
    let full = cluster.roster();
    let a = cluster.node(0).create_lts(LtsId::random(), &full).await.unwrap();
    let b = cluster.node(1).create_lts(LtsId::random(), &full).await.unwrap();

    let reader = KeyPair::random();
    let reqs = vec![
        request(a.lts_id, &a.x, b"a", &reader),
        request(b.lts_id, &b.x, b"b", &reader),
    ];
    // b was rooted at node-1, so its share order differs
    assert!(matches!(
        cluster.node(0).decrypt_keys(&reqs).await,
        Err(Error::RosterMismatch)
    ));
}

#[tokio::test]
async fn test_read_proof_policy_end_to_end() {
    let cluster = LocalCluster::builder(4)
        .authorizer(Arc::new(ReadProofAuthorizer::new(POLICY)))
        .build()
        .unwrap();
    let lts = cluster.node(0).create_lts(LtsId::random(), &cluster.roster()).await.unwrap();
    let reader = KeyPair::random();

    let write = Write::with_document(lts.lts_id, POLICY, &lts.x, b"document key", b"the document").unwrap();
    let req = DecryptKey::with_read_proof(write.clone(), Read::new(&write, reader.public)).unwrap();
    let key = cluster
        .node(0)
        .decrypt_key(&req)
        .await
        .unwrap()
        .recover_key(&reader.private)
        .unwrap();
    assert_eq!(write.open_document(&key).unwrap(), b"the document");

    // a write proven under another policy
    let foreign = Write::new(lts.lts_id, b"other policy", &lts.x, b"document key").unwrap();
    let req = DecryptKey::with_read_proof(foreign.clone(), Read::new(&foreign, reader.public)).unwrap();
    assert!(matches!(cluster.node(0).decrypt_key(&req).await, Err(Error::Refused)));
}

#[tokio::test]
async fn test_shares_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = LocalCluster::builder(4).storage_dir(dir.path()).build().unwrap();
    let lts = cluster.node(0).create_lts(LtsId::random(), &cluster.roster()).await.unwrap();
    for i in 0..4 {
        cluster.restart(i).unwrap();
    }
    assert_eq!(cluster.node(0).get_lts_reply(&lts.lts_id).unwrap(), lts);

    let reader = KeyPair::random();
    let req = request(lts.lts_id, &lts.x, b"persisted", &reader);
    let reply = cluster.node(0).decrypt_key(&req).await.unwrap();
    assert_eq!(reply.recover_key(&reader.private).unwrap(), b"persisted");
}

#[tokio::test]
async fn test_reshare_onto_new_roster() {
    let cluster = LocalCluster::new(6).unwrap();
    let all = cluster.roster();
    let old = calypso_lts::Roster::new(all.list[..4].to_vec());
    let lts = cluster.node(1).create_lts(LtsId::random(), &old).await.unwrap();

    let reader = KeyPair::random();
    let req = request(lts.lts_id, &lts.x, b"kept across rosters", &reader);

    // node-0 leaves, node-4 and node-5 join
    let new = calypso_lts::Roster::new(all.list[1..].to_vec());
    let reshared = cluster.node(2).reshare_lts(lts.lts_id, &new).await.unwrap();
    assert_eq!(reshared.x, lts.x);
    assert_eq!(reshared.roster.len(), 5);
    assert_eq!(reshared.roster.list[0].address, "node-2");

    assert!(matches!(
        cluster.node(0).store().get(&lts.lts_id),
        Err(Error::UnknownLts(_))
    ));
    for i in 1..6 {
        let record = cluster.node(i).store().get(&lts.lts_id).unwrap();
        assert_eq!(record.x, lts.x);
        assert_eq!(record.roster, reshared.roster);
        assert_eq!(record.dks.commits.len(), reshared.roster.threshold());
    }

    // a joining node coordinates, with the leaving node gone
    cluster.pause(0);
    let reply = cluster.node(5).decrypt_key(&req).await.unwrap();
    assert_eq!(reply.recover_key(&reader.private).unwrap(), b"kept across rosters");
}
