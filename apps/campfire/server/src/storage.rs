use async_trait::async_trait;
use campfire_core::{Member, MemberId, MembershipSnapshot, Room, RoomId, RoomPhase, TransportId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached. The caller should retry the
    /// whole intent; no partial write is left behind.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A stored record failed to parse.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Durable membership record: the source of truth for "who should be in
/// the room". The reconciliation engine is the only writer; all calls for
/// one room happen under that room's intent lock, so implementations get
/// read-modify-write atomicity for free and only need per-key durability.
///
/// Every mutation that commits bumps the room's `version`, which is what
/// makes snapshots totally ordered per room.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn create_room(&self, passphrase_hash: &str) -> Result<Room, StoreError>;

    async fn find_room(&self, passphrase_hash: &str) -> Result<Option<Room>, StoreError>;

    async fn room(&self, room_id: RoomId) -> Result<Option<Room>, StoreError>;

    /// Inserts a member. When a row with the same stable id already
    /// exists, overwrites only its transport id (and name, if provided).
    /// Never creates a second row for one stable identity; this is the
    /// mechanism that prevents ghost duplicates across reconnects.
    async fn upsert_member(
        &self,
        room_id: RoomId,
        member_id: MemberId,
        transport_id: TransportId,
        display_name: Option<&str>,
    ) -> Result<Member, StoreError>;

    /// Deletes the member row. Idempotent; returns whether a row existed.
    async fn remove_member(&self, room_id: RoomId, member_id: MemberId)
        -> Result<bool, StoreError>;

    /// Returns false when the member does not exist.
    async fn set_member_role(
        &self,
        room_id: RoomId,
        member_id: MemberId,
        role: &str,
    ) -> Result<bool, StoreError>;

    /// Sets the phase (and scenario, when given). Transition legality is
    /// the engine's job; returns false when the room does not exist.
    async fn advance_room(
        &self,
        room_id: RoomId,
        phase: RoomPhase,
        scenario: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn snapshot(&self, room_id: RoomId) -> Result<Option<MembershipSnapshot>, StoreError>;

    /// Deletes the room when it has zero members and is still `Waiting`.
    /// Opportunistic; never required for correctness.
    async fn reap_room_if_idle(&self, room_id: RoomId) -> Result<bool, StoreError>;

    /// Refreshes store TTLs so active rooms do not age out.
    async fn touch(&self, room_id: RoomId) -> Result<(), StoreError>;
}

fn room_key(room_id: RoomId) -> String {
    format!("campfire:room:{}", room_id)
}

fn members_key(room_id: RoomId) -> String {
    format!("campfire:room:{}:members", room_id)
}

fn passphrase_key(hash: &str) -> String {
    format!("campfire:passphrase:{}", hash)
}

/// Redis-backed [`MembershipStore`]. One JSON value per room, one hash of
/// member-id -> JSON per room, and a passphrase-hash -> room-id index, all
/// expiring after `ttl_seconds` of inactivity.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis, ttl_seconds })
    }

    async fn write_room(
        &self,
        conn: &mut ConnectionManager,
        room: &Room,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(room)?;
        conn.set_ex::<_, _, ()>(room_key(room.id), value, self.ttl_seconds)
            .await?;
        Ok(())
    }

    async fn bump_version(
        &self,
        conn: &mut ConnectionManager,
        room_id: RoomId,
    ) -> Result<(), StoreError> {
        let value: Option<String> = conn.get(room_key(room_id)).await?;
        let Some(json) = value else {
            return Ok(());
        };
        let mut room: Room = serde_json::from_str(&json)?;
        room.version += 1;
        self.write_room(conn, &room).await
    }
}

#[async_trait]
impl MembershipStore for RedisStore {
    async fn create_room(&self, passphrase_hash: &str) -> Result<Room, StoreError> {
        let mut conn = self.redis.clone();
        let pass_key = passphrase_key(passphrase_hash);
        let room = Room::new(Uuid::new_v4(), passphrase_hash.to_string());

        let claimed: bool = conn.set_nx(&pass_key, room.id.to_string()).await?;
        if !claimed {
            // Lost a create race; hand back the winner.
            if let Some(existing) = self.find_room(passphrase_hash).await? {
                return Ok(existing);
            }
            // Index pointed at a reaped room; reclaim it.
            conn.set::<_, _, ()>(&pass_key, room.id.to_string()).await?;
        }
        conn.expire::<_, ()>(&pass_key, self.ttl_seconds as i64)
            .await?;
        self.write_room(&mut conn, &room).await?;
        Ok(room)
    }

    async fn find_room(&self, passphrase_hash: &str) -> Result<Option<Room>, StoreError> {
        let mut conn = self.redis.clone();
        let id: Option<String> = conn.get(passphrase_key(passphrase_hash)).await?;
        match id {
            Some(raw) => {
                let room_id =
                    Uuid::parse_str(&raw).map_err(|err| StoreError::Corrupt(err.to_string()))?;
                self.room(room_id).await
            }
            None => Ok(None),
        }
    }

    async fn room(&self, room_id: RoomId) -> Result<Option<Room>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(room_key(room_id)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn upsert_member(
        &self,
        room_id: RoomId,
        member_id: MemberId,
        transport_id: TransportId,
        display_name: Option<&str>,
    ) -> Result<Member, StoreError> {
        let mut conn = self.redis.clone();
        let key = members_key(room_id);

        let existing: Option<String> = conn.hget(&key, member_id.to_string()).await?;
        let member = match existing {
            Some(json) => {
                let mut member: Member = serde_json::from_str(&json)?;
                member.transport_id = Some(transport_id);
                if let Some(name) = display_name {
                    member.display_name = Some(name.to_string());
                }
                member
            }
            None => Member {
                id: member_id,
                room_id,
                display_name: display_name.map(str::to_string),
                transport_id: Some(transport_id),
                role: None,
                joined_at: OffsetDateTime::now_utc(),
            },
        };

        let value = serde_json::to_string(&member)?;
        conn.hset::<_, _, _, ()>(&key, member_id.to_string(), value)
            .await?;
        conn.expire::<_, ()>(&key, self.ttl_seconds as i64).await?;
        self.bump_version(&mut conn, room_id).await?;
        Ok(member)
    }

    async fn remove_member(
        &self,
        room_id: RoomId,
        member_id: MemberId,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn
            .hdel(members_key(room_id), member_id.to_string())
            .await?;
        if removed > 0 {
            self.bump_version(&mut conn, room_id).await?;
        }
        Ok(removed > 0)
    }

    async fn set_member_role(
        &self,
        room_id: RoomId,
        member_id: MemberId,
        role: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let key = members_key(room_id);

        let existing: Option<String> = conn.hget(&key, member_id.to_string()).await?;
        let Some(json) = existing else {
            return Ok(false);
        };
        let mut member: Member = serde_json::from_str(&json)?;
        member.role = Some(role.to_string());

        let value = serde_json::to_string(&member)?;
        conn.hset::<_, _, _, ()>(&key, member_id.to_string(), value)
            .await?;
        self.bump_version(&mut conn, room_id).await?;
        Ok(true)
    }

    async fn advance_room(
        &self,
        room_id: RoomId,
        phase: RoomPhase,
        scenario: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(room_key(room_id)).await?;
        let Some(json) = value else {
            return Ok(false);
        };
        let mut room: Room = serde_json::from_str(&json)?;
        room.phase = phase;
        if let Some(scenario) = scenario {
            room.scenario = Some(scenario.to_string());
        }
        room.version += 1;
        self.write_room(&mut conn, &room).await?;
        Ok(true)
    }

    async fn snapshot(&self, room_id: RoomId) -> Result<Option<MembershipSnapshot>, StoreError> {
        let Some(room) = self.room(room_id).await? else {
            return Ok(None);
        };

        let mut conn = self.redis.clone();
        let values: Vec<String> = conn.hvals(members_key(room_id)).await?;
        let mut members = Vec::with_capacity(values.len());
        for json in values {
            members.push(serde_json::from_str::<Member>(&json)?);
        }

        let mut snapshot = MembershipSnapshot { room, members };
        snapshot.sort_members();
        Ok(Some(snapshot))
    }

    async fn reap_room_if_idle(&self, room_id: RoomId) -> Result<bool, StoreError> {
        let Some(room) = self.room(room_id).await? else {
            return Ok(false);
        };

        let mut conn = self.redis.clone();
        let remaining: i64 = conn.hlen(members_key(room_id)).await?;
        if remaining > 0 || room.phase != RoomPhase::Waiting {
            return Ok(false);
        }

        redis::pipe()
            .cmd("DEL")
            .arg(room_key(room_id))
            .ignore()
            .cmd("DEL")
            .arg(members_key(room_id))
            .ignore()
            .cmd("DEL")
            .arg(passphrase_key(&room.passphrase_hash))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(true)
    }

    async fn touch(&self, room_id: RoomId) -> Result<(), StoreError> {
        let Some(room) = self.room(room_id).await? else {
            return Ok(());
        };

        let mut conn = self.redis.clone();
        let ttl = self.ttl_seconds as i64;
        conn.expire::<_, ()>(room_key(room_id), ttl).await?;
        conn.expire::<_, ()>(members_key(room_id), ttl).await?;
        conn.expire::<_, ()>(passphrase_key(&room.passphrase_hash), ttl)
            .await?;
        Ok(())
    }
}
