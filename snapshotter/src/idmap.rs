use crate::error::SnapshotterError;

/// One `containerID:hostID:length` triple from an ID-mapping label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub length: u32,
}

/// Parse an ID-mapping label value: comma-separated
/// `containerID:hostID:length` triples.
pub fn parse(mapping: &str) -> Result<Vec<IdMap>, SnapshotterError> {
    mapping.split(',').map(parse_triple).collect()
}

fn parse_triple(triple: &str) -> Result<IdMap, SnapshotterError> {
    let mut fields = triple.splitn(3, ':');
    let (Some(container), Some(host), Some(length)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return Err(SnapshotterError::InvalidArgument(format!(
            "malformed id mapping entry: {triple}"
        )));
    };

    let parse_field = |v: &str| {
        v.parse::<u32>().map_err(|_| {
            SnapshotterError::InvalidArgument(format!("malformed id mapping entry: {triple}"))
        })
    };

    Ok(IdMap {
        container_id: parse_field(container)?,
        host_id: parse_field(host)?,
        length: parse_field(length)?,
    })
}

/// The host uid/gid that container root maps to, used to chown fresh
/// upper directories.
pub fn root_pair(uid_mapping: &str, gid_mapping: &str) -> Result<(u32, u32), SnapshotterError> {
    Ok((host_root(uid_mapping)?, host_root(gid_mapping)?))
}

fn host_root(mapping: &str) -> Result<u32, SnapshotterError> {
    parse(mapping)?
        .iter()
        .find(|m| m.container_id == 0)
        .map(|m| m.host_id)
        .ok_or_else(|| {
            SnapshotterError::InvalidArgument(format!(
                "id mapping does not cover container root: {mapping}"
            ))
        })
}
